//! Symbol normalization (§4.1).
//!
//! Grounded in the teacher's `util::symbol_from_exchange`/`symbol_to_exchange`
//! (longest-match quote-suffix stripping for Binance), generalized to the
//! full ordered quote table the spec names instead of the teacher's
//! two-entry `BINANCE_QUOTES` array.

/// Longest-to-shortest, per §4.1: a longer suffix must be tried before a
/// shorter one so `"BTCUSDT"` doesn't wrongly split on a trailing `"USD"`.
const QUOTE_SUFFIXES: [&str; 7] = ["USDT", "USDC", "BUSD", "USD", "BTC", "ETH", "BNB"];

/// Splits an exchange-native, concatenated symbol (e.g. `"btcusdt"`) into
/// canonical `BASE/QUOTE` form, uppercase. Returns `None` when no known
/// quote suffix matches, per the spec's "implementer's default: reject".
pub fn normalize(raw: &str) -> Option<String> {
    let upper = raw.to_uppercase();
    for quote in QUOTE_SUFFIXES {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return Some(format!("{base}/{quote}"));
            }
        }
    }
    None
}

/// Converts a canonical `BASE/QUOTE` symbol into the concatenated,
/// lowercase wire form Binance-family stream names use, e.g.
/// `"BTC/USDT"` -> `"btcusdt"`.
pub fn to_wire(symbol: &str) -> String {
    symbol.replace('/', "").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_common_quote_assets() {
        assert_eq!(normalize("btcusdt"), Some("BTC/USDT".to_string()));
        assert_eq!(normalize("ETHUSD"), Some("ETH/USD".to_string()));
        assert_eq!(normalize("bnbbtc"), Some("BNB/BTC".to_string()));
    }

    #[test]
    fn prefers_longest_matching_suffix() {
        // "USDC" must win over "USD" for a symbol ending in USDC.
        assert_eq!(normalize("solusdc"), Some("SOL/USDC".to_string()));
    }

    #[test]
    fn rejects_unknown_quote_assets() {
        assert_eq!(normalize("totallyunknown"), None);
    }

    #[test]
    fn rejects_when_base_would_be_empty() {
        // "usdt" alone has no base component.
        assert_eq!(normalize("usdt"), None);
    }

    #[test]
    fn to_wire_strips_slash_and_lowercases() {
        assert_eq!(to_wire("BTC/USDT"), "btcusdt");
    }
}
