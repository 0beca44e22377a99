//! Connection registry
//!
//! Connections toward a media server are registered under its erizo id,
//! keyed either by a bundle key (single-connection mode) or by their own
//! session id. Every live connection, peer-to-peer ones included, is also
//! indexed by session id so stack events can be routed back.

use super::connection::{Connection, ConnectionEvent, ConnectionSpec};
use super::stack::StackFactory;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Registry key under an erizo id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleKey {
    SinglePcPublish,
    SinglePcSubscribe,
    Session(u64),
}

impl BundleKey {
    fn is_bundle(&self) -> bool {
        matches!(self, BundleKey::SinglePcPublish | BundleKey::SinglePcSubscribe)
    }
}

impl std::fmt::Display for BundleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleKey::SinglePcPublish => f.write_str("single-pc-publish"),
            BundleKey::SinglePcSubscribe => f.write_str("single-pc-subscribe"),
            BundleKey::Session(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Default)]
struct Registry {
    by_erizo: HashMap<String, HashMap<BundleKey, Arc<Connection>>>,
    by_session: HashMap<u64, Arc<Connection>>,
}

/// Creates, shares and tears down connections
pub struct ConnectionManager {
    factory: Arc<dyn StackFactory>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    next_session_id: AtomicU64,
    registry: Mutex<Registry>,
    /// Serializes lookup, build and insert so bundle keys are created once
    build_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// Create a manager; connection events of every managed connection
    /// arrive on the returned receiver
    pub fn new(
        factory: Arc<dyn StackFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            factory,
            events,
            next_session_id: AtomicU64::new(1),
            registry: Mutex::new(Registry::default()),
            build_lock: tokio::sync::Mutex::new(()),
        };
        (manager, rx)
    }

    /// Return a connection for `spec`
    ///
    /// Without an erizo id a fresh connection is always built. With
    /// `bundled` the single publish or subscribe connection of that erizo
    /// is reused, built on first need. Otherwise a fresh connection is
    /// registered under its own session id.
    pub async fn get_or_build(
        &self,
        spec: ConnectionSpec,
        erizo_id: Option<&str>,
        bundled: bool,
    ) -> Result<Arc<Connection>> {
        let _guard = self.build_lock.lock().await;

        let Some(erizo_id) = erizo_id else {
            let connection = self.build(spec).await?;
            self.registry
                .lock()
                .by_session
                .insert(connection.session_id(), Arc::clone(&connection));
            return Ok(connection);
        };

        if bundled {
            let key = if spec.stack.is_remote {
                BundleKey::SinglePcSubscribe
            } else {
                BundleKey::SinglePcPublish
            };

            if let Some(existing) = self
                .registry
                .lock()
                .by_erizo
                .get(erizo_id)
                .and_then(|entry| entry.get(&key))
            {
                debug!(
                    "Reusing bundled connection, erizoId: {}, key: {}, sessionId: {}",
                    erizo_id,
                    key,
                    existing.session_id()
                );
                return Ok(Arc::clone(existing));
            }

            let connection = self.build(spec).await?;
            self.insert(erizo_id, key, &connection);
            return Ok(connection);
        }

        let connection = self.build(spec).await?;
        self.insert(
            erizo_id,
            BundleKey::Session(connection.session_id()),
            &connection,
        );
        Ok(connection)
    }

    async fn build(&self, spec: ConnectionSpec) -> Result<Arc<Connection>> {
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        Connection::new(session_id, spec, self.factory.as_ref(), self.events.clone()).await
    }

    fn insert(&self, erizo_id: &str, key: BundleKey, connection: &Arc<Connection>) {
        let mut registry = self.registry.lock();
        registry
            .by_erizo
            .entry(erizo_id.to_string())
            .or_default()
            .insert(key, Arc::clone(connection));
        registry
            .by_session
            .insert(connection.session_id(), Arc::clone(connection));
        debug!(
            "Registered connection, erizoId: {}, key: {}, sessionId: {}",
            erizo_id,
            key,
            connection.session_id()
        );
    }

    /// Close `connection` when it carries no streams or when forced
    ///
    /// A connection under an erizo that still has bundle entries is kept
    /// unless `force` is set; forcing purges both bundle keys as well as
    /// the connection's own key. Returns whether the connection was closed.
    pub fn maybe_close(&self, connection: &Arc<Connection>, force: bool) -> bool {
        if connection.stream_count() > 0 && !force {
            return false;
        }

        {
            let mut registry = self.registry.lock();
            let session_id = connection.session_id();
            if let Some(erizo_id) = connection.erizo_id() {
                if let Some(entry) = registry.by_erizo.get_mut(erizo_id) {
                    let bundled = entry.keys().any(BundleKey::is_bundle);
                    if bundled && !force {
                        debug!(
                            "Keeping bundled connection, erizoId: {}, sessionId: {}",
                            erizo_id, session_id
                        );
                        return false;
                    }
                    entry.remove(&BundleKey::SinglePcPublish);
                    entry.remove(&BundleKey::SinglePcSubscribe);
                    entry.remove(&BundleKey::Session(session_id));
                    if entry.is_empty() {
                        registry.by_erizo.remove(erizo_id);
                    }
                }
            }
            registry.by_session.remove(&session_id);
        }

        connection.close();
        true
    }

    pub fn get(&self, session_id: u64) -> Option<Arc<Connection>> {
        self.registry.lock().by_session.get(&session_id).cloned()
    }

    pub fn get_by_connection_id(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.registry
            .lock()
            .by_session
            .values()
            .find(|c| c.connection_id() == Some(connection_id))
            .cloned()
    }

    /// Registered connection under `erizo_id` and `key`
    pub fn get_registered(&self, erizo_id: &str, key: BundleKey) -> Option<Arc<Connection>> {
        self.registry
            .lock()
            .by_erizo
            .get(erizo_id)
            .and_then(|entry| entry.get(&key))
            .cloned()
    }

    /// Number of registry entries under `erizo_id`
    pub fn registered_count(&self, erizo_id: &str) -> usize {
        self.registry
            .lock()
            .by_erizo
            .get(erizo_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.lock().by_session.values().cloned().collect()
    }

    /// Force-close every connection
    pub fn close_all(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut registry = self.registry.lock();
            registry.by_erizo.clear();
            registry.by_session.drain().map(|(_, c)| c).collect()
        };
        if !connections.is_empty() {
            info!("Closing {} connections", connections.len());
        }
        for connection in connections {
            connection.close();
        }
    }
}
