// TCP reachability probe run before the Redis handshake

use crate::errors::RawConnectionError;
use crate::models::Endpoint;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

/// Resolve `endpoint` and open (then drop) a TCP connection to it.
///
/// Every resolved address is tried in order; the first one that accepts wins.
pub async fn probe_endpoint(endpoint: &Endpoint, timeout: Duration) -> Result<(), RawConnectionError> {
    let address = endpoint.address();
    let after_ms = timeout.as_millis() as u64;

    let lookup = tokio::time::timeout(timeout, lookup_host(address.clone())).await;
    let resolved: Vec<SocketAddr> = match lookup {
        Err(_) => return Err(RawConnectionError::TimedOut { after_ms }),
        Ok(Err(e)) => {
            return Err(RawConnectionError::Unreachable {
                address,
                message: format!("name resolution failed: {}", e),
            })
        }
        Ok(Ok(addrs)) => addrs.collect(),
    };

    if resolved.is_empty() {
        return Err(RawConnectionError::Unreachable {
            address,
            message: "name resolved to no addresses".to_string(),
        });
    }

    let mut last_error = None;
    for addr in resolved {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => {
                debug!(address = %address, resolved = %addr, "TCP probe succeeded");
                return Ok(());
            }
            Ok(Err(e)) => last_error = Some(map_io_error(&address, &e, after_ms)),
            Err(_) => last_error = Some(RawConnectionError::TimedOut { after_ms }),
        }
    }

    Err(last_error.unwrap_or(RawConnectionError::Unreachable {
        address,
        message: "no address accepted the connection".to_string(),
    }))
}

/// Probe several endpoints and return the first reachable one.
///
/// When none is reachable the first endpoint's error is returned.
pub async fn probe_any(endpoints: &[Endpoint], timeout: Duration) -> Result<Endpoint, RawConnectionError> {
    let mut first_error = None;
    for endpoint in endpoints {
        match probe_endpoint(endpoint, timeout).await {
            Ok(()) => return Ok(endpoint.clone()),
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "Node is not reachable");
                first_error.get_or_insert(e);
            }
        }
    }

    Err(first_error.unwrap_or(RawConnectionError::Topology(
        "no nodes configured".to_string(),
    )))
}

pub(crate) fn map_io_error(address: &str, err: &io::Error, after_ms: u64) -> RawConnectionError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => RawConnectionError::Refused {
            address: address.to_string(),
            message: err.to_string(),
        },
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => RawConnectionError::TimedOut { after_ms },
        _ => RawConnectionError::Unreachable {
            address: address.to_string(),
            message: err.to_string(),
        },
    }
}
