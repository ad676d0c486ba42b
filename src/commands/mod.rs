pub mod market_feed;
