//! Exchange feed transport.
//!
//! A [`FeedConnector`] opens one streaming session and yields its text frames.
//! The supervisor only ever sees this trait, so tests can script sessions.

use crate::error::StreamError;
use futures_util::future::{self, BoxFuture};
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

/// Default Binance single-stream WebSocket base.
pub const DEFAULT_FEED_WS_URL: &str = "wss://stream.binance.com:9443/ws";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Text frames of one session. The stream ends when the remote closes.
pub type FrameStream = BoxStream<'static, Result<String, StreamError>>;

/// Opens feed sessions.
pub trait FeedConnector: Send + Sync + 'static {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<FrameStream, StreamError>>;
}

/// Single-stream endpoint for one (symbol, interval).
pub fn kline_stream_url(base: &str, symbol: &str, interval: &str) -> String {
    format!(
        "{}/{}@kline_{}",
        base.trim_end_matches('/'),
        symbol.to_lowercase(),
        interval
    )
}

/// WebSocket connector on `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl FeedConnector for WsConnector {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<FrameStream, StreamError>> {
        open_ws(url).boxed()
    }
}

async fn open_ws(url: String) -> Result<FrameStream, StreamError> {
    info!("Connecting to feed {}", url);
    let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| StreamError::ConnectionLost(format!("connect to {} timed out", url)))??;
    info!("Connected to feed {}", url);

    // Pings are answered by tungstenite while the stream is polled.
    let frames = ws_stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(other) => {
                    debug!("Ignoring non-text frame ({} bytes)", other.len());
                    None
                }
                Err(e) => Some(Err(StreamError::from(e))),
            })
        });

    Ok(frames.boxed())
}
