pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod models;
pub mod relay;
pub mod store;
pub mod transfer;
