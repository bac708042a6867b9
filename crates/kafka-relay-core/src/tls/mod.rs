//! TLS for both legs of a connection pair.
//!
//! - **Server side** (`server`): terminates TLS from clients on the proxy
//!   listeners, optionally verifying client certificates.
//! - **Client side** (`client`): originates TLS towards brokers, with SNI set
//!   to the broker's real host.
//! - **Minted identities** (`authority`): optionally signs a broker-leg client
//!   certificate per client that mirrors the certificate the client
//!   presented.
//!
//! ```rust,ignore
//! use kafka_relay_core::tls::{TlsConnector, TlsServerAcceptor};
//!
//! let acceptor = TlsServerAcceptor::new(&client_tls)?;
//! let client = acceptor.accept(tcp_stream).await?;
//!
//! let connector = TlsConnector::new(&broker_tls)?;
//! let broker = connector
//!     .connect("broker-a.internal", broker_tcp, client.get_ref().1.peer_certificates().and_then(|c| c.first()))
//!     .await?;
//! ```

pub mod authority;
pub mod client;
pub mod pem;
pub mod server;

pub use authority::ClientCertAuthority;
pub use client::TlsConnector;
pub use server::TlsServerAcceptor;
