pub mod config;
pub mod outbound;
pub mod server;
pub mod telemetry;
