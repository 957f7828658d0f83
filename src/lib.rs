//! Minimal forward HTTP proxy serving only `CONNECT` tunnels.

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;

pub use config::schema::ProxyConfig;
pub use lifecycle::Shutdown;
pub use proxy::ProxyServer;
