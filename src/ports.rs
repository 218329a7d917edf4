//! Port allocation backed by real OS bind probes

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use tracing::debug;

/// Number of ephemeral ports tried before giving up
const MAX_ATTEMPTS: usize = 16;

/// Hands out TCP ports that are free on the host
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: IpAddr,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl PortAllocator {
    pub fn new(host: IpAddr) -> Self {
        Self { host }
    }

    /// Check if a port is free by binding and immediately releasing it
    pub fn is_available(&self, port: u16) -> bool {
        TcpListener::bind((self.host, port))
            .and_then(|listener| listener.local_addr())
            .is_ok()
    }

    /// Ask the OS for an ephemeral port, skipping any the caller already holds
    pub fn allocate(&self, in_use: &HashSet<u16>) -> Result<u16, String> {
        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            match TcpListener::bind((self.host, 0)).and_then(|l| l.local_addr()) {
                Ok(addr) if in_use.contains(&addr.port()) => {
                    debug!(port = addr.port(), attempt, "Ephemeral port already assigned, retrying");
                }
                Ok(addr) => {
                    debug!(port = addr.port(), attempt, "Allocated port");
                    return Ok(addr.port());
                }
                Err(e) => {
                    debug!(error = %e, attempt, "Port probe failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => format!("could not bind {}: {}", self.host, e),
            None => format!("no unassigned port after {} attempts", MAX_ATTEMPTS),
        })
    }
}
