pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod relay;
