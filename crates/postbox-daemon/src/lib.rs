pub mod auth;
pub mod middleware;
pub mod server;
pub mod telemetry;
