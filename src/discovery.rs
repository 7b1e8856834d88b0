//! LAN discovery: TCP-probe a /24 for hosts that answer on a port.

use futures::stream::{FuturesUnordered, StreamExt};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::debug;

/// Port probed when the caller has no better idea (the device web UI).
pub const DEFAULT_PROBE_PORT: u16 = 80;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);
pub const DEFAULT_CONCURRENCY: usize = 128;

/// `a.b.c.1` through `a.b.c.254` for the /24 containing `local`.
pub fn subnet_candidates(local: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = local.octets();
    (1..=254).map(|d| Ipv4Addr::new(a, b, c, d)).collect()
}

/// Probe every candidate and return those accepting a TCP connection on
/// `port`, in ascending order.
pub async fn scan_hosts(
    candidates: Vec<Ipv4Addr>,
    port: u16,
    probe_timeout: Duration,
    concurrency: usize,
) -> Vec<Ipv4Addr> {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut probes: FuturesUnordered<_> = candidates
        .into_iter()
        .map(|ip| {
            let permits = permits.clone();
            async move {
                let _permit = permits.acquire_owned().await.ok()?;
                let addr = SocketAddr::new(IpAddr::V4(ip), port);
                match tokio::time::timeout(probe_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(_)) => Some(ip),
                    _ => None,
                }
            }
        })
        .collect();

    let mut found = Vec::new();
    while let Some(hit) = probes.next().await {
        if let Some(ip) = hit {
            debug!(%ip, port, "host reachable");
            found.push(ip);
        }
    }
    found.sort();
    found
}
