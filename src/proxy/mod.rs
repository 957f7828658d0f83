//! CONNECT tunnelling.
//!
//! # Data Flow
//! ```text
//! accepted client stream
//!     → supervisor.rs (identity, span, cleanup)
//!     → request.rs    (read + validate "CONNECT host:port ...")
//!     → establish.rs  (dial destination, send 200)
//!     → relay.rs      (client ⇄ destination until either side ends)
//!     → supervisor.rs (close both streams, log outcome)
//! ```
//!
//! Nothing past the request head is inspected; the tunnel carries
//! whatever the client speaks, usually TLS.

pub mod error;
pub mod establish;
pub mod relay;
pub mod request;
pub mod server;
pub mod supervisor;

pub use error::{Direction, EstablishError, ParseError, Phase, RelayError, TunnelError};
pub use establish::{establish, Connector, TcpConnector, CONNECTION_ESTABLISHED};
pub use relay::{relay, RelaySummary};
pub use request::{read_connect_request, ConnectRequest, ConnectTarget};
pub use server::ProxyServer;
pub use supervisor::{Supervisor, TunnelSummary};
