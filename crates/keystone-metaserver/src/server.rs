use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use keystone_protocol::next_frame;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::MetaServerConfig;
use crate::dataserver::DataServer;
use crate::error::ServerResult;
use crate::router::build_router;
use crate::session::ClientSession;

/// Keystone metaserver: the node protocol listener plus the admin HTTP
/// surface.
pub struct MetaServer {
    data: Arc<DataServer>,
}

impl MetaServer {
    pub fn new(config: MetaServerConfig) -> Self {
        Self {
            data: Arc::new(DataServer::new(config)),
        }
    }

    pub fn with_data_server(data: Arc<DataServer>) -> Self {
        Self { data }
    }

    pub fn config(&self) -> &MetaServerConfig {
        self.data.config()
    }

    pub fn data_server(&self) -> &Arc<DataServer> {
        &self.data
    }

    /// Build the admin router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(self.data.clone())
    }

    /// Bind both listeners and serve until the node listener fails.
    pub async fn serve(self) -> ServerResult<()> {
        if let Some(admin_addr) = self.config().admin_addr {
            let listener = TcpListener::bind(admin_addr).await?;
            info!("metaserver admin listening on {admin_addr}");
            let app = self.router();
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    warn!(error = %e, "admin server stopped");
                }
            });
        }
        let bind_addr = self.config().bind_addr;
        let listener = TcpListener::bind(bind_addr).await?;
        info!("metaserver listening on {bind_addr}");
        self.run(listener).await
    }

    /// Accept node connections on an already bound listener.
    pub async fn run(self, listener: TcpListener) -> ServerResult<()> {
        let slots = Arc::new(Semaphore::new(self.config().max_connections));
        loop {
            let (stream, peer) = listener.accept().await?;
            let Ok(permit) = slots.clone().try_acquire_owned() else {
                warn!(%peer, "connection limit reached, refusing node");
                drop(stream);
                continue;
            };
            let data = self.data.clone();
            tokio::spawn(async move {
                serve_connection(data, stream, peer).await;
                drop(permit);
            });
        }
    }
}

/// Run one node connection to completion, then release everything the node
/// held.
pub async fn serve_connection(data: Arc<DataServer>, stream: TcpStream, peer: SocketAddr) {
    let node = data.register_node(Some(peer));
    let mut session = ClientSession::new(data.clone(), node);
    if let Err(e) = pump(&mut session, stream).await {
        warn!(%node, %peer, error = %e, "closing node connection");
    }
    data.disconnect(node);
}

async fn pump(session: &mut ClientSession, stream: TcpStream) -> ServerResult<()> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(4096);
    let mut out = BytesMut::new();
    loop {
        if reader.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
        while let Some(frame) = next_frame(&mut buf) {
            if let Some(response) = session.handle_frame(&frame)? {
                out.extend_from_slice(&response.encode()?);
            }
        }
        if !out.is_empty() {
            writer.write_all(&out).await?;
            out.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_protocol::{opcode, DataClient, DataOutcome, Request, Response, PROTOCOL_VERSION};
    use keystone_data::{run_transaction, DataConfig, DataContext, SerializationRegistry, TxOutcome};
    use keystone_protocol::{BlockingDataClient, RemoteStorageEngine};
    use keystone_types::{Changeset, Oid};
    use std::time::Duration;

    async fn start() -> (SocketAddr, Arc<DataServer>) {
        let config = MetaServerConfig {
            lock_retry_after_ms: 5,
            ..MetaServerConfig::default()
        };
        let server = MetaServer::new(config);
        let data = server.data_server().clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.run(listener));
        (addr, data)
    }

    async fn node(addr: SocketAddr) -> DataClient {
        let mut client = DataClient::connect(addr).await.unwrap();
        client.login(None).await.unwrap();
        client
    }

    /// Poll for a write lock, failing after about a second.
    async fn eventually_granted(client: &mut DataClient, oid: Oid) -> DataOutcome {
        for _ in 0..100 {
            let outcome = client.request_object("mw", oid, true).await.unwrap();
            if matches!(outcome, DataOutcome::Granted(_)) {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("lock never granted");
    }

    #[test]
    fn server_construction() {
        let server = MetaServer::new(MetaServerConfig::default());
        assert_eq!(server.config().bind_addr, "127.0.0.1:44530".parse().unwrap());
        let _router = server.router();
    }

    #[tokio::test]
    async fn denied_until_holder_releases() {
        let (addr, _) = start().await;
        let mut a = node(addr).await;
        let mut b = node(addr).await;
        let oid = Oid::new(42);

        assert!(matches!(a.request_object("mw", oid, true).await.unwrap(), DataOutcome::Granted(None)));
        assert_eq!(
            b.request_object("mw", oid, true).await.unwrap(),
            DataOutcome::Denied { retry_after_ms: 5 }
        );

        a.release_object("mw", oid).await.unwrap();
        eventually_granted(&mut b, oid).await;
    }

    #[tokio::test]
    async fn changeset_clears_locks_without_disconnect() {
        let (addr, data) = start().await;
        let mut a = node(addr).await;
        let mut b = node(addr).await;
        let key = Oid::new(7);

        assert!(matches!(a.request_object("mw", key, true).await.unwrap(), DataOutcome::Granted(None)));
        let mut changeset = Changeset::new("mw");
        changeset.write_object(key, b"state".to_vec());
        assert!(a.submit_changeset(&changeset).await.unwrap());

        assert_eq!(
            b.request_object("mw", key, true).await.unwrap(),
            DataOutcome::Granted(Some(b"state".to_vec()))
        );
        assert_eq!(data.node_count(), 2);
    }

    #[tokio::test]
    async fn disconnect_releases_held_locks() {
        let (addr, data) = start().await;
        let mut a = node(addr).await;
        let mut b = node(addr).await;
        let key = Oid::new(8);

        assert!(matches!(a.request_object("mw", key, true).await.unwrap(), DataOutcome::Granted(None)));
        assert!(matches!(b.request_object("mw", key, true).await.unwrap(), DataOutcome::Denied { .. }));

        drop(a);
        eventually_granted(&mut b, key).await;
        assert_eq!(data.node_count(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_leaves_connection_usable() {
        let (addr, _) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut bytes = Request::Login {
            version: PROTOCOL_VERSION,
            admin_url: None,
        }
        .encode()
        .unwrap();
        // REQUEST_OBJECT with a truncated payload, then an unknown opcode.
        bytes.extend_from_slice(&[0x00, 0x02, opcode::REQUEST_OBJECT, b'm', b'w']);
        bytes.extend_from_slice(&[0x00, 0x00, 0xEE]);
        bytes.extend_from_slice(&Request::RequestOids { app: "mw".into() }.encode().unwrap());
        stream.write_all(&bytes).await.unwrap();

        let mut buf = BytesMut::new();
        let frame = loop {
            if let Some(frame) = next_frame(&mut buf) {
                break frame;
            }
            assert!(stream.read_buf(&mut buf).await.unwrap() > 0, "connection closed");
        };
        let Response::Oids(block) = Response::decode(&frame).unwrap() else {
            panic!("expected an oid block");
        };
        assert_eq!(block.start, Oid::new(0));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn oid_requests_share_one_counter() {
        let (addr, _) = start().await;
        let mut a = node(addr).await;
        let mut b = node(addr).await;
        let first = a.request_oids("mw").await.unwrap();
        let second = b.request_oids("mw").await.unwrap();
        assert!(first.is_disjoint(&second));
        assert!(first.start < second.start);
    }

    /// Metaserver on its own runtime, so blocking node clients can run on
    /// the test thread.
    fn start_background() -> (tokio::runtime::Runtime, SocketAddr) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let server = MetaServer::new(MetaServerConfig::default());
        let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();
        runtime.spawn(server.run(listener));
        (runtime, addr)
    }

    fn node_context(addr: SocketAddr) -> (Arc<RemoteStorageEngine>, DataContext) {
        let client = Arc::new(BlockingDataClient::connect(addr, None).unwrap());
        let engine = Arc::new(RemoteStorageEngine::new(client));
        let mut registry = SerializationRegistry::new();
        registry.register_type::<String>("string").unwrap();
        let config = DataConfig {
            max_attempts: 1,
            retry_backoff_ms: 0,
            ..DataConfig::default()
        };
        let ctx = Arc::clone(&engine)
            .open_context("mw", Arc::new(registry), config)
            .unwrap();
        (engine, ctx)
    }

    #[test]
    fn nodes_read_each_others_commits() {
        let (_runtime, addr) = start_background();
        let (engine_a, a) = node_context(addr);
        let (engine_b, b) = node_context(addr);

        let ada = run_transaction(&a, |tx| {
            let r = tx.create_reference("ada's save".to_string())?;
            tx.set_binding("ada", r)?;
            Ok(r)
        })
        .into_result()
        .unwrap();
        assert_eq!(engine_a.held_locks(), 0);

        let mut tx = b.begin().unwrap();
        let seen = tx.get_binding::<String>("ada").unwrap().unwrap();
        assert_eq!(seen.oid(), ada.oid());
        assert_eq!(tx.dereference(seen).unwrap(), "ada's save");
        let bob = tx.create_reference("bob's save".to_string()).unwrap();
        tx.set_binding("ada", bob).unwrap();
        tx.commit().unwrap();
        assert_eq!(engine_b.held_locks(), 0);
        assert_ne!(bob.oid(), ada.oid());

        let mut tx = a.begin().unwrap();
        assert_eq!(tx.get_binding_oid("ada").unwrap(), Some(bob.oid()));
        assert_eq!(tx.dereference(bob).unwrap(), "bob's save");
        tx.rollback();
        assert_eq!(engine_a.held_locks(), 0);
    }

    #[test]
    fn node_is_denied_while_another_holds_the_object() {
        let (_runtime, addr) = start_background();
        let (_engine_a, a) = node_context(addr);
        let (engine_b, b) = node_context(addr);
        let score = run_transaction(&a, |tx| {
            let r = tx.create_reference("0".to_string())?;
            tx.set_binding("score", r)?;
            Ok(r)
        })
        .into_result()
        .unwrap();

        let mut holder = a.begin().unwrap();
        holder.dereference_mut(score).unwrap().push('1');

        let denied = run_transaction(&b, |tx| {
            tx.dereference_mut(score)?.push('2');
            Ok(())
        });
        assert!(matches!(denied, TxOutcome::RetryableConflict { attempts: 1, .. }));
        assert_eq!(engine_b.held_locks(), 0);

        holder.commit().unwrap();
        let retried = run_transaction(&b, |tx| {
            tx.dereference_mut(score)?.push('2');
            Ok(())
        });
        assert!(retried.is_committed());

        let mut tx = a.begin().unwrap();
        assert_eq!(tx.dereference(score).unwrap(), "012");
    }

    #[test]
    fn binding_scan_merges_uncommitted_changes() {
        let (_runtime, addr) = start_background();
        let (_engine_a, a) = node_context(addr);
        let (engine_b, b) = node_context(addr);
        run_transaction(&a, |tx| {
            for name in ["p.a", "p.b", "p.c"] {
                let r = tx.create_reference(name.to_string())?;
                tx.set_binding(name, r)?;
            }
            Ok(())
        })
        .into_result()
        .unwrap();

        let mut tx = b.begin().unwrap();
        tx.remove_binding("p.b").unwrap();
        let r = tx.create_reference("p.bb".to_string()).unwrap();
        tx.set_binding("p.bb", r).unwrap();
        let mut names = Vec::new();
        let mut cursor: Option<String> = None;
        while let Some(name) = tx.next_binding(cursor.as_deref()).unwrap() {
            names.push(name.clone());
            cursor = Some(name);
        }
        assert_eq!(names, ["p.a", "p.bb", "p.c"]);
        tx.rollback();
        assert_eq!(engine_b.held_locks(), 0);
    }
}
