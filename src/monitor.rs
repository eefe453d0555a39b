//! Local network reachability detection.
//!
//! A short-timeout TCP dial to a well-known endpoint; any failure reads as
//! "offline". The result is cached and subscribers are notified exactly once
//! per online/offline transition.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

const DEFAULT_PROBE_ADDR: &str = "8.8.8.8:53";
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

type StatusCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Polls network reachability and fans out transition notifications.
pub struct NetworkMonitor {
    probe_addr: SocketAddr,
    probe_timeout: Duration,
    online: AtomicBool,
    callbacks: Mutex<Vec<StatusCallback>>,
}

impl NetworkMonitor {
    /// Monitor probing the default public endpoint (`8.8.8.8:53`).
    #[must_use]
    pub fn new() -> Self {
        let addr = DEFAULT_PROBE_ADDR
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([8, 8, 8, 8], 53)));
        Self::with_probe(addr, DEFAULT_PROBE_TIMEOUT)
    }

    /// Monitor probing a caller-chosen endpoint. Tests point this at a local
    /// listener (or an unbound port) to script online/offline transitions.
    #[must_use]
    pub fn with_probe(probe_addr: SocketAddr, probe_timeout: Duration) -> Self {
        Self {
            probe_addr,
            probe_timeout,
            // Assume reachable until the first probe says otherwise
            online: AtomicBool::new(true),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback invoked with the new status on every transition.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    /// Last observed status without probing.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Probe reachability, cache the result, and notify subscribers on change.
    pub async fn check_status(&self) -> bool {
        let reachable = matches!(
            timeout(self.probe_timeout, TcpStream::connect(self.probe_addr)).await,
            Ok(Ok(_))
        );

        let previous = self.online.swap(reachable, Ordering::AcqRel);
        if previous != reachable {
            if reachable {
                tracing::info!("network is back online");
            } else {
                tracing::warn!("network appears to be offline");
            }
            self.notify(reachable);
        }

        reachable
    }

    fn notify(&self, online: bool) {
        let Ok(callbacks) = self.callbacks.lock() else {
            return;
        };
        for callback in callbacks.iter() {
            callback(online);
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}
