//! Identity of a connection pair, carried into logs.

use std::fmt;
use std::net::SocketAddr;

/// Who is connected to which broker listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    connection_id: u64,
    broker_id: i32,
    client_address: SocketAddr,
    tls: bool,
}

impl ConnectionContext {
    #[must_use]
    pub fn new(connection_id: u64, broker_id: i32, client_address: SocketAddr, tls: bool) -> Self {
        Self {
            connection_id,
            broker_id,
            client_address,
            tls,
        }
    }

    /// Process-unique, assigned at accept time.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Broker whose listener accepted the client.
    #[must_use]
    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }

    #[must_use]
    pub fn client_address(&self) -> SocketAddr {
        self.client_address
    }

    /// Whether the client leg is TLS.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls
    }
}

impl fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conn-{} (client={}, broker={}{})",
            self.connection_id,
            self.client_address,
            self.broker_id,
            if self.tls { ", tls" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let addr: SocketAddr = "192.168.1.100:45678".parse().unwrap();
        let plain = ConnectionContext::new(7, 2, addr, false);
        assert_eq!(plain.to_string(), "conn-7 (client=192.168.1.100:45678, broker=2)");

        let tls = ConnectionContext::new(8, 2, addr, true);
        assert!(tls.to_string().ends_with(", tls)"));
        assert_eq!(tls.broker_id(), 2);
        assert_eq!(tls.client_address(), addr);
    }
}
