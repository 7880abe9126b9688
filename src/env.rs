//! Shared server environment and the live-tunnel registry

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::cipher::{CipherError, Method, Obfs, Protocol, TunnelCipher};
use crate::config::Config;

/// Read-mostly bag of configuration and factories shared by every tunnel
/// on this listener. Tunnels hold it behind an `Arc` and never mutate it.
pub struct ServerEnv {
    config: Config,
    registry: TunnelRegistry,
}

impl ServerEnv {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: TunnelRegistry::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    /// Build a cipher pipeline from the configured selectors. Re-entrant;
    /// each tunnel gets its own context.
    pub fn create_cipher(&self, max_chunk: usize) -> Result<TunnelCipher, CipherError> {
        let method = Method::from_name(&self.config.method)?;
        let protocol = Protocol::from_name(&self.config.protocol)?;
        let obfs = Obfs::from_name(&self.config.obfs)?;
        TunnelCipher::create(method, protocol, obfs, &self.config.password, max_chunk)
    }
}

/// The set of live tunnels, keyed by tunnel id. Each entry holds the
/// tunnel's shutdown signal; `shutdown_all` snapshots the set and fires
/// every signal, tolerating tunnels that remove themselves concurrently.
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<u64, Arc<Notify>>>,
    next_id: AtomicU64,
}

impl TunnelRegistry {
    fn new() -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id and register a fresh shutdown signal for it.
    pub fn register(&self) -> (u64, Arc<Notify>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let notify = Arc::new(Notify::new());
        self.tunnels.lock().insert(id, notify.clone());
        (id, notify)
    }

    /// Remove a tunnel; called from its dying path. Removing an id twice
    /// is a no-op.
    pub fn remove(&self, id: u64) {
        self.tunnels.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.tunnels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.lock().is_empty()
    }

    /// Request shutdown of every live tunnel.
    pub fn shutdown_all(&self) {
        let snapshot: Vec<Arc<Notify>> = self.tunnels.lock().values().cloned().collect();
        debug!("shutting down {} tunnels", snapshot.len());
        for notify in snapshot {
            notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_remove() {
        let registry = TunnelRegistry::new();
        let (a, _na) = registry.register();
        let (b, _nb) = registry.register();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        registry.remove(a);
        registry.remove(a);
        assert_eq!(registry.len(), 1);
        registry.remove(b);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_all_fires_every_signal() {
        let registry = TunnelRegistry::new();
        let (_ida, na) = registry.register();
        let (_idb, nb) = registry.register();

        registry.shutdown_all();

        // notify_one leaves a permit, so waits that start late still fire.
        na.notified().await;
        nb.notified().await;
    }

    #[test]
    fn test_cipher_factory_rejects_unknown_selectors() {
        let mut config = Config::default();
        config.method = "rot13".to_string();
        let env = ServerEnv::new(config);
        assert!(env.create_cipher(crate::MAX_CHUNK_SIZE).is_err());
    }
}
