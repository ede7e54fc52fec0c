//! Transport abstraction (§9 "injectable WebSocket transport").
//!
//! The Connection Manager never calls `tokio_tungstenite::connect_async`
//! directly; it goes through a `Connector`, split into a writer/reader pair
//! the same way the teacher splits `ws.split()` in `collector/runner.rs`,
//! but behind trait objects so tests can swap in an in-memory fake and
//! drive reconnection/heartbeat/debounce deterministically.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::errors::{EngineError, EngineResult};

/// A frame the CM wants to write out.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

/// A frame received from the remote end.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

#[async_trait::async_trait]
pub trait WsWriter: Send {
    async fn send(&mut self, frame: OutboundFrame) -> EngineResult<()>;
    async fn close(&mut self) -> EngineResult<()>;
}

#[async_trait::async_trait]
pub trait WsReader: Send {
    /// Returns `None` when the stream is exhausted (socket closed).
    async fn recv(&mut self) -> Option<EngineResult<InboundFrame>>;
}

#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> EngineResult<(Box<dyn WsWriter>, Box<dyn WsReader>)>;
}

/// Real connector backed by `tokio-tungstenite` (teacher: `connect_async`).
pub struct TungsteniteConnector;

#[async_trait::async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> EngineResult<(Box<dyn WsWriter>, Box<dyn WsReader>)> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| EngineError::transport(format!("connect to {url} failed: {e}")))?;
        let (write, read) = ws.split();
        Ok((Box::new(TungsteniteWriter(write)), Box::new(TungsteniteReader(read))))
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsSource = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

struct TungsteniteWriter(WsSink);

#[async_trait::async_trait]
impl WsWriter for TungsteniteWriter {
    async fn send(&mut self, frame: OutboundFrame) -> EngineResult<()> {
        let message = match frame {
            OutboundFrame::Text(text) => Message::Text(text.into()),
            OutboundFrame::Ping(payload) => Message::Ping(payload.into()),
            OutboundFrame::Pong(payload) => Message::Pong(payload.into()),
        };
        self.0
            .send(message)
            .await
            .map_err(|e| EngineError::transport(format!("send failed: {e}")))
    }

    async fn close(&mut self) -> EngineResult<()> {
        self.0
            .close()
            .await
            .map_err(|e| EngineError::transport(format!("close failed: {e}")))
    }
}

struct TungsteniteReader(WsSource);

#[async_trait::async_trait]
impl WsReader for TungsteniteReader {
    async fn recv(&mut self) -> Option<EngineResult<InboundFrame>> {
        loop {
            let next = self.0.next().await?;
            return Some(match next {
                Ok(Message::Text(text)) => Ok(InboundFrame::Text(text.to_string())),
                Ok(Message::Ping(payload)) => Ok(InboundFrame::Ping(payload.to_vec())),
                Ok(Message::Pong(payload)) => Ok(InboundFrame::Pong(payload.to_vec())),
                Ok(Message::Close(_)) => Ok(InboundFrame::Close),
                Ok(Message::Binary(_) | Message::Frame(_)) => continue,
                Err(e) => Err(EngineError::transport(format!("read failed: {e}"))),
            });
        }
    }
}

#[cfg(test)]
pub mod mock {
    //! In-memory `Connector` for deterministic CM tests: each `connect`
    //! call hands back one end of a pair of channels, and the test keeps
    //! the other end to simulate the remote exchange (send pings, close
    //! the socket, etc.) without any real I/O.
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    pub struct MockHandle {
        pub to_client: mpsc::UnboundedSender<InboundFrame>,
        pub from_client: mpsc::UnboundedReceiver<OutboundFrame>,
    }

    pub struct MockConnector {
        handles: std::sync::Mutex<Vec<mpsc::UnboundedSender<MockHandle>>>,
        connect_attempts: Arc<AtomicUsize>,
        fail_first_n: usize,
    }

    impl MockConnector {
        pub fn new(fail_first_n: usize) -> Arc<Self> {
            Arc::new(Self {
                handles: std::sync::Mutex::new(Vec::new()),
                connect_attempts: Arc::new(AtomicUsize::new(0)),
                fail_first_n,
            })
        }

        pub fn attempts(&self) -> usize {
            self.connect_attempts.load(Ordering::SeqCst)
        }

        /// Registers a watcher that receives the `MockHandle` for the next
        /// successful `connect` call.
        pub fn next_connection(&self) -> mpsc::UnboundedReceiver<MockHandle> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.handles.lock().unwrap().push(tx);
            rx
        }
    }

    #[async_trait::async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _url: &str) -> EngineResult<(Box<dyn WsWriter>, Box<dyn WsReader>)> {
            let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first_n {
                return Err(EngineError::transport("mock connect failure"));
            }

            let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
            let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();

            if let Some(tx) = self.handles.lock().unwrap().pop() {
                let _ = tx.send(MockHandle { to_client: to_client_tx, from_client: from_client_rx });
            }

            Ok((
                Box::new(MockWriter(from_client_tx)),
                Box::new(MockReader(to_client_rx)),
            ))
        }
    }

    struct MockWriter(mpsc::UnboundedSender<OutboundFrame>);

    #[async_trait::async_trait]
    impl WsWriter for MockWriter {
        async fn send(&mut self, frame: OutboundFrame) -> EngineResult<()> {
            self.0.send(frame).map_err(|_| EngineError::transport("mock peer dropped"))
        }

        async fn close(&mut self) -> EngineResult<()> {
            Ok(())
        }
    }

    struct MockReader(mpsc::UnboundedReceiver<InboundFrame>);

    #[async_trait::async_trait]
    impl WsReader for MockReader {
        async fn recv(&mut self) -> Option<EngineResult<InboundFrame>> {
            self.0.recv().await.map(Ok)
        }
    }
}
