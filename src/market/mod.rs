pub mod backfill;
pub mod candle_store;
pub mod coordinator;
pub mod ledger;
pub mod numeric;
pub mod order_book;
pub mod pipeline;
pub mod throttle;
pub mod types;
pub mod zoom;

pub const INBOUND_CHANNEL_CAPACITY: usize = 1_024;
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;
