pub mod account;
pub mod candle;
pub mod order;
pub mod suspicious;
pub mod ws;

pub use account::*;
pub use candle::*;
pub use order::*;
pub use suspicious::*;
pub use ws::*;
