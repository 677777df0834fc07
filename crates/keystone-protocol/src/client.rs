use bytes::BytesMut;
use keystone_types::{Changeset, Oid, OidBlock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, trace};

use crate::codec::next_frame;
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{DataOutcome, DataResponse, Request, Response, PROTOCOL_VERSION};

/// Node-side connection to the metaserver.
///
/// Requests are answered in order, so one outstanding call at a time is
/// enough; callers that share a client serialize access to it.
pub struct DataClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl DataClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> ProtocolResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "connected to metaserver");
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        })
    }

    pub async fn login(&mut self, admin_url: Option<&str>) -> ProtocolResult<()> {
        self.send(&Request::Login {
            version: PROTOCOL_VERSION,
            admin_url: admin_url.map(str::to_string),
        })
        .await
    }

    pub async fn send(&mut self, request: &Request) -> ProtocolResult<()> {
        let frame = request.encode()?;
        trace!(request = request.type_name(), bytes = frame.len(), "sending request");
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> ProtocolResult<Response> {
        loop {
            if let Some(frame) = next_frame(&mut self.buf) {
                return Response::decode(&frame);
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
        }
    }

    /// Send a request and wait for its response.
    pub async fn call(&mut self, request: &Request) -> ProtocolResult<Response> {
        self.send(request).await?;
        self.recv().await
    }

    pub async fn request_oids(&mut self, app: &str) -> ProtocolResult<OidBlock> {
        match self.call(&Request::RequestOids { app: app.to_string() }).await? {
            Response::Oids(block) => Ok(block),
            other => Err(unexpected("OIDS_RESPONSE", &other)),
        }
    }

    pub async fn request_object(&mut self, app: &str, oid: Oid, for_write: bool) -> ProtocolResult<DataOutcome> {
        let request = Request::RequestObject {
            app: app.to_string(),
            oid,
            for_write,
        };
        match self.call(&request).await? {
            Response::Object(DataResponse { outcome, .. }) => Ok(outcome),
            other => Err(unexpected("OBJECT_RESPONSE", &other)),
        }
    }

    /// Granted data, when present, is the bound oid (see [`decode_binding_oid`]).
    pub async fn request_binding(&mut self, app: &str, name: &str, for_write: bool) -> ProtocolResult<DataOutcome> {
        let request = Request::RequestBinding {
            app: app.to_string(),
            name: name.to_string(),
            for_write,
        };
        match self.call(&request).await? {
            Response::Binding(DataResponse { outcome, .. }) => Ok(outcome),
            other => Err(unexpected("BINDING_RESPONSE", &other)),
        }
    }

    pub async fn request_next_binding(&mut self, app: &str, key: Option<&str>) -> ProtocolResult<DataOutcome> {
        let request = Request::RequestNextBinding {
            app: app.to_string(),
            key: key.map(str::to_string),
        };
        match self.call(&request).await? {
            Response::NextBinding(DataResponse { outcome, .. }) => Ok(outcome),
            other => Err(unexpected("NEXT_BINDING_RESPONSE", &other)),
        }
    }

    /// Returns whether the metaserver applied the changeset.
    pub async fn submit_changeset(&mut self, changeset: &Changeset) -> ProtocolResult<bool> {
        match self.call(&Request::SubmitChangeset(changeset.clone())).await? {
            Response::Changeset { accepted, .. } => Ok(accepted),
            other => Err(unexpected("CHANGESET_RESPONSE", &other)),
        }
    }

    pub async fn release_object(&mut self, app: &str, oid: Oid) -> ProtocolResult<()> {
        self.send(&Request::ReleaseObject {
            app: app.to_string(),
            oid,
        })
        .await
    }

    pub async fn release_binding(&mut self, app: &str, name: &str) -> ProtocolResult<()> {
        self.send(&Request::ReleaseBinding {
            app: app.to_string(),
            name: name.to_string(),
        })
        .await
    }

    pub async fn release_binding_range(&mut self, app: &str, from: Option<&str>, to: Option<&str>) -> ProtocolResult<()> {
        self.send(&Request::ReleaseBindingRange {
            app: app.to_string(),
            from: from.map(str::to_string),
            to: to.map(str::to_string),
        })
        .await
    }
}

/// Decode the oid carried by a granted binding response.
pub fn decode_binding_oid(data: &[u8]) -> ProtocolResult<Oid> {
    Oid::from_key(data).map_err(|_| ProtocolError::Truncated("binding oid"))
}

fn unexpected(expected: &'static str, got: &Response) -> ProtocolError {
    ProtocolError::UnexpectedResponse {
        expected,
        got: got.type_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::next_frame;
    use tokio::net::TcpListener;

    /// Accept one connection and answer each request with `reply`.
    async fn serve_once(reply: fn(Request) -> Option<Response>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            loop {
                while let Some(frame) = next_frame(&mut buf) {
                    let request = Request::decode(&frame).unwrap();
                    if let Some(response) = reply(request) {
                        socket.write_all(&response.encode().unwrap()).await.unwrap();
                    }
                }
                if socket.read_buf(&mut buf).await.unwrap() == 0 {
                    return;
                }
            }
        });
        addr
    }

    fn echo(request: Request) -> Option<Response> {
        match request {
            Request::RequestOids { .. } => Some(Response::Oids(OidBlock::new(Oid::new(200), 100).unwrap())),
            Request::RequestObject { app, oid, for_write } => Some(Response::Object(if for_write {
                DataResponse::denied(app, 50)
            } else {
                DataResponse::granted(app, Some(oid.to_key().to_vec()))
            })),
            Request::RequestBinding { app, .. } => {
                Some(Response::Binding(DataResponse::granted(app, Some(Oid::new(9).to_key().to_vec()))))
            }
            Request::SubmitChangeset(changeset) => Some(Response::Changeset {
                accepted: !changeset.is_empty(),
                app: changeset.app,
            }),
            _ => None,
        }
    }

    #[tokio::test]
    async fn calls_get_matching_responses() {
        let addr = serve_once(echo).await;
        let mut client = DataClient::connect(addr).await.unwrap();
        client.login(Some("http://localhost:9000")).await.unwrap();
        client.release_object("mw", Oid::new(1)).await.unwrap();

        let block = client.request_oids("mw").await.unwrap();
        assert_eq!((block.start, block.size), (Oid::new(200), 100));

        assert_eq!(
            client.request_object("mw", Oid::new(3), false).await.unwrap(),
            DataOutcome::Granted(Some(Oid::new(3).to_key().to_vec()))
        );
        assert_eq!(
            client.request_object("mw", Oid::new(3), true).await.unwrap(),
            DataOutcome::Denied { retry_after_ms: 50 }
        );

        let DataOutcome::Granted(Some(bytes)) = client.request_binding("mw", "ada", false).await.unwrap() else {
            panic!("binding not granted");
        };
        assert_eq!(decode_binding_oid(&bytes).unwrap(), Oid::new(9));

        let mut changeset = Changeset::new("mw");
        changeset.bind("ada", Oid::new(9));
        assert!(client.submit_changeset(&changeset).await.unwrap());
    }

    #[tokio::test]
    async fn mismatched_response_is_an_error() {
        fn wrong(_: Request) -> Option<Response> {
            Some(Response::Changeset {
                app: "mw".into(),
                accepted: true,
            })
        }
        let addr = serve_once(wrong).await;
        let mut client = DataClient::connect(addr).await.unwrap();
        assert!(matches!(
            client.request_oids("mw").await,
            Err(ProtocolError::UnexpectedResponse { .. })
        ));
    }

    #[tokio::test]
    async fn closed_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });
        let mut client = DataClient::connect(addr).await.unwrap();
        assert!(matches!(
            client.request_oids("mw").await,
            Err(ProtocolError::ConnectionClosed) | Err(ProtocolError::Io(_))
        ));
    }
}
