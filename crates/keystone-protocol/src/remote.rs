use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use keystone_oids::{OidAllocationStrategy, OidError, OidResult};
use keystone_types::{Changeset, Oid, OidBlock};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::client::DataClient;
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::DataOutcome;

/// Synchronous facade over [`DataClient`] with its own single-threaded
/// runtime.
///
/// Meant for the data layer's blocking seams; calling it from inside another
/// tokio runtime panics.
pub struct BlockingDataClient {
    runtime: Runtime,
    client: Mutex<DataClient>,
}

impl BlockingDataClient {
    /// Connect and log in.
    pub fn connect(addr: SocketAddr, admin_url: Option<&str>) -> ProtocolResult<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let client = runtime.block_on(async {
            let mut client = DataClient::connect(addr).await?;
            client.login(admin_url).await?;
            Ok::<_, ProtocolError>(client)
        })?;
        debug!(%addr, "blocking metaserver client ready");
        Ok(Self {
            runtime,
            client: Mutex::new(client),
        })
    }

    pub fn request_oids(&self, app: &str) -> ProtocolResult<OidBlock> {
        let mut client = self.client.lock().expect("lock poisoned");
        self.runtime.block_on(client.request_oids(app))
    }

    pub fn request_object(&self, app: &str, oid: Oid, for_write: bool) -> ProtocolResult<DataOutcome> {
        let mut client = self.client.lock().expect("lock poisoned");
        self.runtime.block_on(client.request_object(app, oid, for_write))
    }

    pub fn request_binding(&self, app: &str, name: &str, for_write: bool) -> ProtocolResult<DataOutcome> {
        let mut client = self.client.lock().expect("lock poisoned");
        self.runtime.block_on(client.request_binding(app, name, for_write))
    }

    pub fn request_next_binding(&self, app: &str, key: Option<&str>) -> ProtocolResult<DataOutcome> {
        let mut client = self.client.lock().expect("lock poisoned");
        self.runtime.block_on(client.request_next_binding(app, key))
    }

    pub fn submit_changeset(&self, changeset: &Changeset) -> ProtocolResult<bool> {
        let mut client = self.client.lock().expect("lock poisoned");
        self.runtime.block_on(client.submit_changeset(changeset))
    }

    pub fn release_object(&self, app: &str, oid: Oid) -> ProtocolResult<()> {
        let mut client = self.client.lock().expect("lock poisoned");
        self.runtime.block_on(client.release_object(app, oid))
    }

    pub fn release_binding(&self, app: &str, name: &str) -> ProtocolResult<()> {
        let mut client = self.client.lock().expect("lock poisoned");
        self.runtime.block_on(client.release_binding(app, name))
    }

    pub fn release_binding_range(&self, app: &str, from: Option<&str>, to: Option<&str>) -> ProtocolResult<()> {
        let mut client = self.client.lock().expect("lock poisoned");
        self.runtime.block_on(client.release_binding_range(app, from, to))
    }
}

/// Oid blocks reserved by the metaserver on behalf of one application.
pub struct RemoteOidStrategy {
    client: Arc<BlockingDataClient>,
    app: String,
}

impl RemoteOidStrategy {
    pub fn new(client: Arc<BlockingDataClient>, app: impl Into<String>) -> Self {
        Self {
            client,
            app: app.into(),
        }
    }
}

impl OidAllocationStrategy for RemoteOidStrategy {
    fn reserve_block(&self) -> OidResult<OidBlock> {
        self.client
            .request_oids(&self.app)
            .map_err(|e| OidError::Remote(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::next_frame;
    use crate::message::{Request, Response};
    use bytes::BytesMut;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    /// Blocking fake metaserver: consecutive 10-oid blocks, rejects empty
    /// changesets.
    fn fake_metaserver() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let next = AtomicU64::new(0);
            let mut buf = BytesMut::new();
            let mut chunk = [0u8; 1024];
            loop {
                while let Some(frame) = next_frame(&mut buf) {
                    let response = match Request::decode(&frame).unwrap() {
                        Request::RequestOids { .. } => {
                            let start = next.fetch_add(10, Ordering::SeqCst);
                            Response::Oids(OidBlock::new(Oid::new(start), 10).unwrap())
                        }
                        Request::SubmitChangeset(changeset) => Response::Changeset {
                            accepted: !changeset.is_empty(),
                            app: changeset.app,
                        },
                        _ => continue,
                    };
                    socket.write_all(&response.encode().unwrap()).unwrap();
                }
                match socket.read(&mut chunk) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
        });
        addr
    }

    #[test]
    fn remote_strategy_reserves_consecutive_blocks() {
        let client = Arc::new(BlockingDataClient::connect(fake_metaserver(), None).unwrap());
        let strategy = RemoteOidStrategy::new(client, "mw");
        let first = strategy.reserve_block().unwrap();
        let second = strategy.reserve_block().unwrap();
        assert_eq!(first.start, Oid::new(0));
        assert_eq!(second.start, Oid::new(10));
        assert!(first.is_disjoint(&second));
    }

    #[test]
    fn changeset_acceptance_is_reported() {
        let client = BlockingDataClient::connect(fake_metaserver(), Some("http://node:1")).unwrap();
        let mut changeset = Changeset::new("mw");
        changeset.write_object(Oid::new(4), vec![1, 2, 3]);
        assert!(client.submit_changeset(&changeset).unwrap());
        assert!(!client.submit_changeset(&Changeset::new("mw")).unwrap());
    }

    #[test]
    fn unreachable_metaserver_fails_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(BlockingDataClient::connect(addr, None).is_err());
    }
}
