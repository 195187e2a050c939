pub mod feed;
pub mod paper_execution;
pub mod websocket;

pub use feed::{ohlc_subscription, parse_message, KrakenCandleFeed, DEFAULT_READ_TIMEOUT};
pub use paper_execution::PaperExecutionHandler;
pub use websocket::{KrakenWebSocket, WsEvent};
