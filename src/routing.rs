//! Routing synchronization between the live process set and the reverse proxy
//!
//! The table is always recomputed in full from the live entries and pushed
//! whole. A failed push is reported to the caller as a warning and retried
//! implicitly by the next mutation's recompute.

use crate::domain::variant_domain;
use crate::error::ProxyError;
use crate::process::RuntimeKey;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Domain to upstream port mapping
pub type RoutingTable = BTreeMap<String, u16>;

/// The reverse proxy collaborator
#[async_trait]
pub trait ReverseProxy: Send + Sync {
    /// Human-readable proxy name for logs
    fn name(&self) -> &'static str;

    /// Launch the proxy
    async fn start(&self) -> Result<(), ProxyError>;

    /// Replace the proxy's routes with `table`
    async fn apply(&self, table: &RoutingTable) -> Result<(), ProxyError>;

    /// Shut the proxy down
    async fn stop(&self) -> Result<(), ProxyError>;
}

/// Input to the domain function for one live entry
#[derive(Debug, Clone)]
pub struct LiveRoute {
    pub key: RuntimeKey,
    pub is_worktree: bool,
    pub port: u16,
}

/// Compute the routing table for a set of live entries.
///
/// Two keys that derive the same domain cannot both be routed; the first in
/// key order keeps the domain.
pub fn compute_table(routes: &[LiveRoute], tld: &str) -> RoutingTable {
    let mut sorted: Vec<&LiveRoute> = routes.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    let mut table = RoutingTable::new();
    for route in sorted {
        let domain = variant_domain(
            &route.key.server,
            route.is_worktree,
            route.key.variant.as_deref(),
            tld,
        );
        if let Some(existing) = table.get(&domain) {
            warn!(
                domain = %domain,
                key = %route.key,
                kept_port = existing,
                "Domain collision, route not added"
            );
            continue;
        }
        table.insert(domain, route.port);
    }
    table
}

/// Pushes recomputed routing tables to the reverse proxy
pub struct RoutingSync {
    proxy: Arc<dyn ReverseProxy>,
    tld: String,
    /// False in direct-access mode (proxy unavailable)
    enabled: AtomicBool,
    current: RwLock<RoutingTable>,
    in_sync: AtomicBool,
    /// Serializes pushes so tables reach the proxy in recompute order
    push_lock: tokio::sync::Mutex<()>,
}

impl RoutingSync {
    pub fn new(proxy: Arc<dyn ReverseProxy>, tld: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            proxy,
            tld: tld.into(),
            enabled: AtomicBool::new(true),
            current: RwLock::new(RoutingTable::new()),
            in_sync: AtomicBool::new(true),
            push_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn proxy(&self) -> &Arc<dyn ReverseProxy> {
        &self.proxy
    }

    pub fn tld(&self) -> &str {
        &self.tld
    }

    /// Enable or disable pushing (disabled means direct-access mode)
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// The last computed table
    pub fn current(&self) -> RoutingTable {
        self.current.read().clone()
    }

    /// Whether the proxy accepted the last computed table
    pub fn in_sync(&self) -> bool {
        self.in_sync.load(Ordering::SeqCst)
    }

    /// Recompute from `routes` and push. Returns a warning if the push failed.
    pub async fn sync(&self, routes: &[LiveRoute]) -> Option<String> {
        let table = compute_table(routes, &self.tld);
        let _guard = self.push_lock.lock().await;
        *self.current.write() = table.clone();

        if !self.is_enabled() {
            debug!(routes = table.len(), "Direct-access mode, routing push skipped");
            self.in_sync.store(false, Ordering::SeqCst);
            return None;
        }

        match self.proxy.apply(&table).await {
            Ok(()) => {
                self.in_sync.store(true, Ordering::SeqCst);
                info!(proxy = self.proxy.name(), routes = table.len(), "Routing table applied");
                None
            }
            Err(e) => {
                self.in_sync.store(false, Ordering::SeqCst);
                warn!(proxy = self.proxy.name(), error = %e, "Routing sync failed");
                Some(format!("routing sync failed: {}", e))
            }
        }
    }
}

/// Reverse proxy that keeps routes in memory.
///
/// Useful when embedding the supervisor behind an in-process router, and as
/// a stand-in for the real proxy in tests. Can be switched into a failing
/// mode to simulate an unreachable proxy.
#[derive(Default)]
pub struct InMemoryProxy {
    table: RwLock<RoutingTable>,
    applied: Mutex<Vec<RoutingTable>>,
    fail_apply: AtomicBool,
    fail_start: AtomicBool,
    running: AtomicBool,
}

impl InMemoryProxy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent `apply` calls fail (or succeed again)
    pub fn set_fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `start` calls fail (or succeed again)
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Routes currently held by the proxy
    pub fn table(&self) -> RoutingTable {
        self.table.read().clone()
    }

    /// Port routed for `domain`, if any
    pub fn route(&self, domain: &str) -> Option<u16> {
        self.table.read().get(domain).copied()
    }

    /// Number of accepted pushes
    pub fn apply_count(&self) -> usize {
        self.applied.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReverseProxy for InMemoryProxy {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn start(&self) -> Result<(), ProxyError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ProxyError::Start("simulated start failure".to_string()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn apply(&self, table: &RoutingTable) -> Result<(), ProxyError> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(ProxyError::Unreachable("simulated outage".to_string()));
        }
        *self.table.write() = table.clone();
        self.applied.lock().push(table.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProxyError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}
