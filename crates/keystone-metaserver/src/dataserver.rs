use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use keystone_oids::{OidAllocationStrategy, StorageOidStrategy};
use keystone_protocol::{DataOutcome, ProtocolError, PROTOCOL_VERSION};
use keystone_storage::{AppStores, InMemoryStorageEngine, StorageEngine, StorageTransaction, StoreError};
use keystone_types::{BindingChange, Changeset, NodeId, ObjectChange, Oid, OidBlock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::MetaServerConfig;
use crate::error::ServerResult;
use crate::locks::{LockKey, LockMode, LockTable};

#[derive(Clone)]
struct AppState {
    stores: AppStores,
    oids: Arc<StorageOidStrategy>,
}

#[derive(Clone, Debug)]
struct NodeInfo {
    peer: Option<SocketAddr>,
    admin_url: Option<String>,
    logged_in: bool,
    connected_at: DateTime<Utc>,
}

/// A connected node as reported by the admin endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct NodeSummary {
    pub node_id: u32,
    pub peer: Option<String>,
    pub admin_url: Option<String>,
    pub logged_in: bool,
    pub connected_at: DateTime<Utc>,
    pub locks_held: usize,
}

/// The canonical store every node reads through and commits to.
///
/// Owns one storage engine with a `names`/`oids`/`meta` triple per
/// application, the cross-node [`LockTable`], and the registry of connected
/// nodes. All methods are synchronous and safe to call from any connection
/// task.
pub struct DataServer {
    engine: Arc<dyn StorageEngine>,
    config: MetaServerConfig,
    apps: Mutex<HashMap<String, AppState>>,
    locks: Mutex<LockTable>,
    nodes: Mutex<BTreeMap<NodeId, NodeInfo>>,
    next_node: AtomicU32,
}

impl DataServer {
    pub fn new(config: MetaServerConfig) -> Self {
        Self::with_engine(config, Arc::new(InMemoryStorageEngine::new()))
    }

    pub fn with_engine(config: MetaServerConfig, engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            engine,
            config,
            apps: Mutex::new(HashMap::new()),
            locks: Mutex::new(LockTable::new()),
            nodes: Mutex::new(BTreeMap::new()),
            next_node: AtomicU32::new(1),
        }
    }

    pub fn config(&self) -> &MetaServerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    fn app(&self, app: &str) -> ServerResult<AppState> {
        let mut apps = self.apps.lock().expect("lock poisoned");
        if let Some(state) = apps.get(app) {
            return Ok(state.clone());
        }
        let stores = AppStores::open(self.engine.as_ref(), app)?;
        let oids = Arc::new(StorageOidStrategy::with_block_size(
            self.engine.clone(),
            stores.meta.clone(),
            self.config.oid_block_size,
        ));
        info!(app, "opened application stores");
        let state = AppState { stores, oids };
        apps.insert(app.to_string(), state.clone());
        Ok(state)
    }

    /// Names of the applications opened so far.
    pub fn apps(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apps.lock().expect("lock poisoned").keys().cloned().collect();
        names.sort();
        names
    }

    fn denied(&self) -> DataOutcome {
        DataOutcome::Denied {
            retry_after_ms: self.config.lock_retry_after_ms,
        }
    }

    /// Assign the next node id to a fresh connection.
    pub fn register_node(&self, peer: Option<SocketAddr>) -> NodeId {
        let node = NodeId(self.next_node.fetch_add(1, Ordering::SeqCst));
        self.nodes.lock().expect("lock poisoned").insert(
            node,
            NodeInfo {
                peer,
                admin_url: None,
                logged_in: false,
                connected_at: Utc::now(),
            },
        );
        debug!(%node, ?peer, "node connected");
        node
    }

    pub fn login(&self, node: NodeId, version: u8, admin_url: Option<String>) -> ServerResult<()> {
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: version,
            }
            .into());
        }
        if let Some(info) = self.nodes.lock().expect("lock poisoned").get_mut(&node) {
            info.logged_in = true;
            info.admin_url = admin_url.clone();
        }
        info!(%node, admin_url = admin_url.as_deref().unwrap_or(""), "node logged in");
        Ok(())
    }

    /// Forget a node and release every lock it holds.
    pub fn disconnect(&self, node: NodeId) -> usize {
        self.nodes.lock().expect("lock poisoned").remove(&node);
        let released = self.release_all(node);
        info!(%node, released, "node disconnected");
        released
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().expect("lock poisoned").len()
    }

    pub fn nodes(&self) -> Vec<NodeSummary> {
        let nodes: Vec<(NodeId, NodeInfo)> = self
            .nodes
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(id, info)| (*id, info.clone()))
            .collect();
        let locks = self.locks.lock().expect("lock poisoned");
        nodes
            .into_iter()
            .map(|(id, info)| NodeSummary {
                node_id: id.0,
                peer: info.peer.map(|p| p.to_string()),
                admin_url: info.admin_url,
                logged_in: info.logged_in,
                connected_at: info.connected_at,
                locks_held: locks.held_by(id),
            })
            .collect()
    }

    /// Reserve a fresh oid block for `app`.
    pub fn reserve_oids(&self, app: &str) -> ServerResult<OidBlock> {
        let block = self.app(app)?.oids.reserve_block()?;
        debug!(app, start = block.start.value(), size = block.size, "granted oid block");
        Ok(block)
    }

    /// Lock an object and return its current payload.
    pub fn request_object(&self, node: NodeId, app: &str, oid: Oid, for_write: bool) -> ServerResult<DataOutcome> {
        let state = self.app(app)?;
        let mut locks = self.locks.lock().expect("lock poisoned");
        if !locks.acquire(node, app, LockKey::Object(oid), mode(for_write)) {
            return Ok(self.denied());
        }
        match self.read(&state.stores.oids, &oid.to_key()) {
            Ok(data) => Ok(DataOutcome::Granted(data)),
            Err(e) => {
                locks.release(node, app, LockKey::Object(oid));
                Err(e)
            }
        }
    }

    /// Lock a binding and return the oid it names, encoded as 8 BE bytes.
    pub fn request_binding(&self, node: NodeId, app: &str, name: &str, for_write: bool) -> ServerResult<DataOutcome> {
        let state = self.app(app)?;
        let key = LockKey::Binding(name.to_string());
        let mut locks = self.locks.lock().expect("lock poisoned");
        if !locks.acquire(node, app, key.clone(), mode(for_write)) {
            return Ok(self.denied());
        }
        match self.read(&state.stores.names, name.as_bytes()) {
            Ok(data) => Ok(DataOutcome::Granted(data)),
            Err(e) => {
                locks.release(node, app, key);
                Err(e)
            }
        }
    }

    /// Find the first binding after `key` and range-lock `(key, next]`.
    pub fn request_next_binding(&self, node: NodeId, app: &str, key: Option<&str>) -> ServerResult<DataOutcome> {
        let state = self.app(app)?;
        let mut locks = self.locks.lock().expect("lock poisoned");
        let next = {
            let mut tx = self.engine.begin()?;
            let next = tx.next_key(&state.stores.names, key.map(str::as_bytes));
            tx.rollback();
            next?
        };
        let next = next
            .map(|bytes| {
                String::from_utf8(bytes).map_err(|e| StoreError::Corrupt {
                    store: state.stores.names.name().to_string(),
                    key: hex::encode(e.as_bytes()),
                    reason: "binding name is not UTF-8".into(),
                })
            })
            .transpose()?;
        if !locks.acquire_range(node, app, key, next.as_deref()) {
            return Ok(self.denied());
        }
        Ok(DataOutcome::Granted(next.map(String::into_bytes)))
    }

    /// Apply a node's committed changeset.
    ///
    /// Returns `false`, with nothing applied, when another node holds a lock
    /// on any touched key. On success the submitter's locks on every touched
    /// key are cleared; locks on keys it only read stay until released.
    pub fn process_changeset(&self, node: NodeId, changeset: &Changeset) -> ServerResult<bool> {
        let app = changeset.app.as_str();
        let state = self.app(app)?;
        let keys: Vec<LockKey> = changeset
            .touched_oids()
            .into_iter()
            .map(LockKey::Object)
            .chain(changeset.touched_bindings().into_iter().map(LockKey::Binding))
            .collect();

        let mut locks = self.locks.lock().expect("lock poisoned");
        if let Some(key) = keys.iter().find(|key| !locks.can_acquire(node, app, key, LockMode::Write)) {
            debug!(%node, app, ?key, "changeset rejected on lock conflict");
            return Ok(false);
        }

        let mut tx = self.engine.begin()?;
        if let Err(e) = apply_changeset(tx.as_mut(), &state.stores, changeset) {
            tx.rollback();
            warn!(%node, app, error = %e, "changeset failed to apply");
            return Err(e.into());
        }
        tx.commit()?;

        for key in keys {
            locks.release(node, app, key);
        }
        debug!(
            %node,
            app,
            objects = changeset.objects.len(),
            bindings = changeset.bindings.len(),
            "changeset applied"
        );
        Ok(true)
    }

    pub fn release_object(&self, node: NodeId, app: &str, oid: Oid) {
        self.locks
            .lock()
            .expect("lock poisoned")
            .release(node, app, LockKey::Object(oid));
    }

    pub fn release_binding(&self, node: NodeId, app: &str, name: &str) {
        self.locks
            .lock()
            .expect("lock poisoned")
            .release(node, app, LockKey::Binding(name.to_string()));
    }

    pub fn release_binding_range(&self, node: NodeId, app: &str, from: Option<&str>, to: Option<&str>) -> usize {
        self.locks
            .lock()
            .expect("lock poisoned")
            .release_range(node, app, from, to)
    }

    pub fn release_all(&self, node: NodeId) -> usize {
        self.locks.lock().expect("lock poisoned").release_all(node)
    }

    fn read(&self, store: &keystone_storage::Store, key: &[u8]) -> ServerResult<Option<Vec<u8>>> {
        let mut tx = self.engine.begin()?;
        let value = tx.get(store, key);
        tx.rollback();
        Ok(value?)
    }
}

fn mode(for_write: bool) -> LockMode {
    if for_write {
        LockMode::Write
    } else {
        LockMode::Read
    }
}

fn apply_changeset(
    tx: &mut dyn StorageTransaction,
    stores: &AppStores,
    changeset: &Changeset,
) -> Result<(), StoreError> {
    for change in &changeset.objects {
        match change {
            ObjectChange::Write { oid, data } => tx.put(&stores.oids, &oid.to_key(), data)?,
            ObjectChange::Delete { oid } => {
                tx.delete(&stores.oids, &oid.to_key())?;
            }
        }
    }
    for change in &changeset.bindings {
        match change {
            BindingChange::Bind { name, oid } => tx.put(&stores.names, name.as_bytes(), &oid.to_key())?,
            BindingChange::Unbind { name } => {
                tx.delete(&stores.names, name.as_bytes())?;
            }
        }
    }
    tx.prepare()
}

impl std::fmt::Debug for DataServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataServer")
            .field("apps", &self.apps())
            .field("nodes", &self.node_count())
            .finish()
    }
}
