pub mod feed;
pub mod history;
pub mod kline;
pub mod supervisor;

pub use feed::{kline_stream_url, FeedConnector, FrameStream, WsConnector};
pub use history::KlineHistoryClient;
pub use kline::{decode_frame, CandleAggregator, RawKline};
pub use supervisor::{ReconnectPolicy, StreamSupervisor, SubscriptionHandle, SubscriptionState};
