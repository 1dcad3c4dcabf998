pub mod config;
pub mod dispatch;
pub mod health;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod utils;
