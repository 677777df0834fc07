use std::sync::Arc;

use keystone_protocol::{opcode, DataResponse, Frame, Request, Response};
use keystone_types::NodeId;
use tracing::{trace, warn};

use crate::dataserver::DataServer;
use crate::error::ServerResult;

/// Request dispatch for one node connection.
///
/// Errors returned from [`ClientSession::handle_frame`] end the connection;
/// everything recoverable is answered or dropped here.
pub struct ClientSession {
    server: Arc<DataServer>,
    node: NodeId,
}

impl ClientSession {
    pub fn new(server: Arc<DataServer>, node: NodeId) -> Self {
        Self { server, node }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Decode and handle one frame. Frames that fail to parse are logged and
    /// dropped with no effect.
    pub fn handle_frame(&mut self, frame: &Frame) -> ServerResult<Option<Response>> {
        match Request::decode(frame) {
            Ok(request) => self.handle(request),
            Err(e) => {
                warn!(
                    node = %self.node,
                    opcode = opcode::name(frame.opcode),
                    len = frame.payload.len(),
                    error = %e,
                    "dropping malformed frame"
                );
                Ok(None)
            }
        }
    }

    pub fn handle(&mut self, request: Request) -> ServerResult<Option<Response>> {
        let node = self.node;
        trace!(%node, request = request.type_name(), "dispatching request");
        let response = match request {
            Request::Login { version, admin_url } => {
                self.server.login(node, version, admin_url)?;
                None
            }
            Request::RequestOids { app } => Some(Response::Oids(self.server.reserve_oids(&app)?)),
            Request::RequestObject { app, oid, for_write } => {
                let outcome = self.server.request_object(node, &app, oid, for_write);
                Some(Response::Object(self.data_response(app, outcome)))
            }
            Request::RequestBinding { app, name, for_write } => {
                let outcome = self.server.request_binding(node, &app, &name, for_write);
                Some(Response::Binding(self.data_response(app, outcome)))
            }
            Request::RequestNextBinding { app, key } => {
                let outcome = self.server.request_next_binding(node, &app, key.as_deref());
                Some(Response::NextBinding(self.data_response(app, outcome)))
            }
            Request::SubmitChangeset(changeset) => {
                let accepted = match self.server.process_changeset(node, &changeset) {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(%node, app = %changeset.app, error = %e, "changeset failed");
                        false
                    }
                };
                Some(Response::Changeset {
                    app: changeset.app,
                    accepted,
                })
            }
            Request::ReleaseObject { app, oid } => {
                self.server.release_object(node, &app, oid);
                None
            }
            Request::ReleaseBinding { app, name } => {
                self.server.release_binding(node, &app, &name);
                None
            }
            Request::ReleaseBindingRange { app, from, to } => {
                self.server
                    .release_binding_range(node, &app, from.as_deref(), to.as_deref());
                None
            }
        };
        Ok(response)
    }

    /// Storage faults on lookups are reported to the node as a denial so its
    /// transaction retries.
    fn data_response(&self, app: String, outcome: ServerResult<keystone_protocol::DataOutcome>) -> DataResponse {
        match outcome {
            Ok(outcome) => DataResponse { app, outcome },
            Err(e) => {
                warn!(node = %self.node, app, error = %e, "lookup failed");
                DataResponse::denied(app, self.server.config().lock_retry_after_ms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetaServerConfig;
    use bytes::Bytes;
    use keystone_protocol::{DataOutcome, PROTOCOL_VERSION};
    use keystone_types::{Changeset, Oid};

    fn session() -> (Arc<DataServer>, ClientSession) {
        let server = Arc::new(DataServer::new(MetaServerConfig::default()));
        let node = server.register_node(None);
        (server.clone(), ClientSession::new(server, node))
    }

    #[test]
    fn malformed_frame_is_dropped() {
        let (server, mut session) = session();
        let frame = Frame {
            opcode: opcode::REQUEST_OBJECT,
            payload: Bytes::from_static(b"mw"),
        };
        assert!(session.handle_frame(&frame).unwrap().is_none());
        assert_eq!(server.release_all(session.node()), 0);
    }

    #[test]
    fn unknown_opcode_is_dropped() {
        let (_, mut session) = session();
        let frame = Frame {
            opcode: 0xEE,
            payload: Bytes::new(),
        };
        assert!(session.handle_frame(&frame).unwrap().is_none());
    }

    #[test]
    fn bad_version_ends_session() {
        let (_, mut session) = session();
        let login = Request::Login {
            version: PROTOCOL_VERSION + 1,
            admin_url: None,
        };
        assert!(session.handle(login).is_err());
    }

    #[test]
    fn requests_get_typed_responses() {
        let (_, mut session) = session();
        let login = Request::Login {
            version: PROTOCOL_VERSION,
            admin_url: None,
        };
        assert!(session.handle(login).unwrap().is_none());

        let mut encoded = Request::RequestOids { app: "mw".into() }.encode().unwrap();
        let frame = keystone_protocol::next_frame(&mut encoded).unwrap();
        assert!(matches!(session.handle_frame(&frame).unwrap(), Some(Response::Oids(_))));

        let mut changeset = Changeset::new("mw");
        changeset.write_object(Oid::new(1), vec![7]);
        assert_eq!(
            session.handle(Request::SubmitChangeset(changeset)).unwrap(),
            Some(Response::Changeset {
                app: "mw".into(),
                accepted: true
            })
        );

        let response = session
            .handle(Request::RequestObject {
                app: "mw".into(),
                oid: Oid::new(1),
                for_write: false,
            })
            .unwrap();
        assert_eq!(
            response,
            Some(Response::Object(DataResponse::granted("mw", Some(vec![7]))))
        );
    }

    #[test]
    fn write_conflict_is_a_denial_not_an_error() {
        let (server, mut holder) = session();
        let mut other = ClientSession::new(server.clone(), server.register_node(None));
        let request = Request::RequestObject {
            app: "mw".into(),
            oid: Oid::new(42),
            for_write: true,
        };
        holder.handle(request.clone()).unwrap();
        let Some(Response::Object(denied)) = other.handle(request).unwrap() else {
            panic!("expected object response");
        };
        assert_eq!(denied.outcome, DataOutcome::Denied { retry_after_ms: 20 });
    }
}
