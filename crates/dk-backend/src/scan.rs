//! LAN port scanning seam.
//!
//! Host discovery lives outside this crate; the relay only needs something
//! that answers "which hosts have this port open".

use dk_core::ScanReport;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Upper bound on one scan, kept under the gateway's reply window.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(8);

pub type ScanFuture<'a> = Pin<Box<dyn Future<Output = Vec<String>> + Send + 'a>>;

pub trait LanScanner: Send + Sync {
    /// Addresses of LAN hosts accepting connections on `port`.
    fn scan(&self, port: u16) -> ScanFuture<'_>;
}

/// Reports no hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoScanner;

impl LanScanner for NoScanner {
    fn scan(&self, _port: u16) -> ScanFuture<'_> {
        Box::pin(async { Vec::new() })
    }
}

/// Run `scanner` under `wait` and turn the outcome into a reply body.
pub async fn run_scan(scanner: &dyn LanScanner, port: u16, wait: Duration) -> ScanReport {
    match tokio::time::timeout(wait, scanner.scan(port)).await {
        Ok(hosts) => ScanReport::hosts(hosts, port),
        Err(_) => ScanReport::failure(format!("scan of port {port} timed out")),
    }
}
