pub mod market_ws;
pub mod rtds;
pub mod user_ws;

pub use market_ws::MarketStream;
pub use rtds::RtdsStream;
pub use user_ws::UserStream;
