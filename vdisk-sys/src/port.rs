// SPDX-License-Identifier: GPL-3.0-only

//! TCP port liveness probe

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::debug;

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Whether something on localhost accepts connections on `port`.
pub fn is_in_use(port: u16) -> bool {
    is_in_use_within(port, DEFAULT_PROBE_TIMEOUT)
}

/// Same as [`is_in_use`] with an explicit connect timeout.
///
/// Any connection failure (refused, timed out, unreachable) means the port
/// is treated as free.
pub fn is_in_use_within(port: u16, timeout: Duration) -> bool {
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match TcpStream::connect_timeout(&address, timeout) {
        Ok(_) => true,
        Err(error) => {
            debug!(port, "port probe did not connect: {}", error);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn listening_port_is_in_use() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        assert!(is_in_use(port));
    }

    #[test]
    fn closed_port_is_free() {
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
            listener.local_addr().expect("local addr").port()
        };
        assert!(!is_in_use_within(port, Duration::from_millis(200)));
    }
}
