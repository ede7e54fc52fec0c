//! Connection Manager module (§4.2): one CM per upstream WebSocket session.

pub mod backoff;
pub mod events;
pub mod manager;
pub mod transport;

pub use events::CmEvent;
pub use manager::{
    build_combined_url, ConnectionManager, ConnectionMetrics, ConnectionMetricsSnapshot,
    ConnectionState, Health,
};
pub use transport::{Connector, InboundFrame, OutboundFrame, TungsteniteConnector, WsReader, WsWriter};
