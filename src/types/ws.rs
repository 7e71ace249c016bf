use super::{Candle, LatestPrice};
use serde::{Deserialize, Serialize};

/// Incoming WebSocket message from client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Only push these symbols from now on.
    Subscribe { symbols: Vec<String> },
    /// Stop pushing these symbols.
    Unsubscribe { symbols: Vec<String> },
}

/// Outgoing WebSocket message to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Latest close of every stream the client follows.
    PriceUpdate { data: Vec<LatestPrice> },
    /// A bar that just closed.
    CandleClosed { data: Candle },
    /// Symbols the client now follows (empty means all).
    Subscribed { symbols: Vec<String> },
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","symbols":["btcusdt"]}"#).unwrap();
        match msg {
            ClientMessage::Subscribe { symbols } => assert_eq!(symbols, vec!["btcusdt"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_server_message_tags() {
        let json = serde_json::to_string(&ServerMessage::PriceUpdate { data: vec![] }).unwrap();
        assert_eq!(json, r#"{"type":"priceUpdate","data":[]}"#);

        let json = serde_json::to_string(&ServerMessage::Error {
            error: "bad".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"error""#));
    }
}
