use bytes::BytesMut;
use keystone_types::{BindingChange, Changeset, ObjectChange, Oid, OidBlock};

use crate::codec::{encode_frame, Frame};
use crate::error::{ProtocolError, ProtocolResult};
use crate::opcode;
use crate::wire::{
    put_bool, put_cstr, put_nullable_str, put_oid, put_opt_bytes, put_opt_oid, WireReader,
};

pub const PROTOCOL_VERSION: u8 = 0x01;

/// Messages sent by a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Login {
        version: u8,
        admin_url: Option<String>,
    },
    RequestOids {
        app: String,
    },
    RequestObject {
        app: String,
        oid: Oid,
        for_write: bool,
    },
    RequestBinding {
        app: String,
        name: String,
        for_write: bool,
    },
    /// `key: None` asks for the first binding.
    RequestNextBinding {
        app: String,
        key: Option<String>,
    },
    SubmitChangeset(Changeset),
    ReleaseObject {
        app: String,
        oid: Oid,
    },
    ReleaseBinding {
        app: String,
        name: String,
    },
    /// `None` bounds are open-ended.
    ReleaseBindingRange {
        app: String,
        from: Option<String>,
        to: Option<String>,
    },
}

impl Request {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Login { .. } => opcode::LOGIN,
            Self::RequestOids { .. } => opcode::REQUEST_OIDS,
            Self::RequestObject { .. } => opcode::REQUEST_OBJECT,
            Self::RequestBinding { .. } => opcode::REQUEST_BINDING,
            Self::RequestNextBinding { .. } => opcode::REQUEST_NEXT_BINDING,
            Self::SubmitChangeset(_) => opcode::SUBMIT_CHANGESET,
            Self::ReleaseObject { .. } => opcode::RELEASE_OBJECT,
            Self::ReleaseBinding { .. } => opcode::RELEASE_BINDING,
            Self::ReleaseBindingRange { .. } => opcode::RELEASE_BINDING_RANGE,
        }
    }

    pub fn type_name(&self) -> &'static str {
        opcode::name(self.opcode())
    }

    /// Whether the metaserver answers this request.
    pub fn expects_response(&self) -> bool {
        !matches!(
            self,
            Self::Login { .. }
                | Self::ReleaseObject { .. }
                | Self::ReleaseBinding { .. }
                | Self::ReleaseBindingRange { .. }
        )
    }

    pub fn encode(&self) -> ProtocolResult<BytesMut> {
        encode_frame(self.opcode(), |buf| self.write_payload(buf))
    }

    fn write_payload(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        match self {
            Self::Login { version, admin_url } => {
                buf.extend_from_slice(&[*version]);
                put_cstr(buf, admin_url.as_deref().unwrap_or_default())
            }
            Self::RequestOids { app } => put_cstr(buf, app),
            Self::RequestObject { app, oid, for_write } => {
                put_cstr(buf, app)?;
                put_bool(buf, *for_write);
                put_oid(buf, *oid);
                Ok(())
            }
            Self::RequestBinding { app, name, for_write } => {
                put_cstr(buf, app)?;
                put_cstr(buf, name)?;
                put_bool(buf, *for_write);
                Ok(())
            }
            Self::RequestNextBinding { app, key } => {
                put_cstr(buf, app)?;
                put_nullable_str(buf, key.as_deref())
            }
            Self::SubmitChangeset(changeset) => write_changeset(buf, changeset),
            Self::ReleaseObject { app, oid } => {
                put_cstr(buf, app)?;
                put_oid(buf, *oid);
                Ok(())
            }
            Self::ReleaseBinding { app, name } => {
                put_cstr(buf, app)?;
                put_cstr(buf, name)
            }
            Self::ReleaseBindingRange { app, from, to } => {
                put_cstr(buf, app)?;
                put_nullable_str(buf, from.as_deref())?;
                put_nullable_str(buf, to.as_deref())
            }
        }
    }

    /// Parse a request frame. Nothing is returned unless every field parses.
    pub fn decode(frame: &Frame) -> ProtocolResult<Self> {
        let mut r = WireReader::new(&frame.payload);
        let request = match frame.opcode {
            opcode::LOGIN => {
                let version = r.read_u8()?;
                let url = r.read_cstr()?;
                Self::Login {
                    version,
                    admin_url: (!url.is_empty()).then_some(url),
                }
            }
            opcode::REQUEST_OIDS => Self::RequestOids { app: r.read_cstr()? },
            opcode::REQUEST_OBJECT => Self::RequestObject {
                app: r.read_cstr()?,
                for_write: r.read_bool()?,
                oid: r.read_oid()?,
            },
            opcode::REQUEST_BINDING => Self::RequestBinding {
                app: r.read_cstr()?,
                name: r.read_cstr()?,
                for_write: r.read_bool()?,
            },
            opcode::REQUEST_NEXT_BINDING => Self::RequestNextBinding {
                app: r.read_cstr()?,
                key: r.read_nullable_str()?,
            },
            opcode::SUBMIT_CHANGESET => Self::SubmitChangeset(read_changeset(&mut r)?),
            opcode::RELEASE_OBJECT => Self::ReleaseObject {
                app: r.read_cstr()?,
                oid: r.read_oid()?,
            },
            opcode::RELEASE_BINDING => Self::ReleaseBinding {
                app: r.read_cstr()?,
                name: r.read_cstr()?,
            },
            opcode::RELEASE_BINDING_RANGE => Self::ReleaseBindingRange {
                app: r.read_cstr()?,
                from: r.read_nullable_str()?,
                to: r.read_nullable_str()?,
            },
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok(request)
    }
}

fn write_changeset(buf: &mut BytesMut, changeset: &Changeset) -> ProtocolResult<()> {
    put_cstr(buf, &changeset.app)?;
    put_count(buf, changeset.objects.len())?;
    for change in &changeset.objects {
        put_oid(buf, change.oid());
        match change {
            ObjectChange::Write { data, .. } => put_opt_bytes(buf, Some(data.as_slice()))?,
            ObjectChange::Delete { .. } => put_opt_bytes(buf, None)?,
        }
    }
    put_count(buf, changeset.bindings.len())?;
    for change in &changeset.bindings {
        put_cstr(buf, change.name())?;
        match change {
            BindingChange::Bind { oid, .. } => put_opt_oid(buf, Some(*oid)),
            BindingChange::Unbind { .. } => put_opt_oid(buf, None),
        }
    }
    Ok(())
}

fn put_count(buf: &mut BytesMut, count: usize) -> ProtocolResult<()> {
    let count = u32::try_from(count).map_err(|_| ProtocolError::MessageTooLarge {
        size: count,
        max: u32::MAX as usize,
    })?;
    buf.extend_from_slice(&count.to_be_bytes());
    Ok(())
}

fn read_changeset(r: &mut WireReader<'_>) -> ProtocolResult<Changeset> {
    let mut changeset = Changeset::new(r.read_cstr()?);
    let objects = r.read_u32()?;
    for _ in 0..objects {
        let oid = r.read_oid()?;
        match r.read_opt_bytes()? {
            Some(data) => changeset.write_object(oid, data),
            None => changeset.delete_object(oid),
        };
    }
    let bindings = r.read_u32()?;
    for _ in 0..bindings {
        let name = r.read_cstr()?;
        match r.read_opt_oid()? {
            Some(oid) => changeset.bind(name, oid),
            None => changeset.unbind(name),
        };
    }
    Ok(changeset)
}

/// Answer to an object, binding or next-binding request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataResponse {
    pub app: String,
    pub outcome: DataOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataOutcome {
    /// The lock was granted. `None` means no such object or binding.
    Granted(Option<Vec<u8>>),
    /// Another node holds a conflicting lock.
    Denied { retry_after_ms: u64 },
}

impl DataResponse {
    pub fn granted(app: impl Into<String>, data: Option<Vec<u8>>) -> Self {
        Self {
            app: app.into(),
            outcome: DataOutcome::Granted(data),
        }
    }

    pub fn denied(app: impl Into<String>, retry_after_ms: u64) -> Self {
        Self {
            app: app.into(),
            outcome: DataOutcome::Denied { retry_after_ms },
        }
    }

    fn write(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        put_cstr(buf, &self.app)?;
        match &self.outcome {
            DataOutcome::Granted(data) => {
                put_bool(buf, true);
                put_opt_bytes(buf, data.as_deref())
            }
            DataOutcome::Denied { retry_after_ms } => {
                put_bool(buf, false);
                buf.extend_from_slice(&retry_after_ms.to_be_bytes());
                Ok(())
            }
        }
    }

    fn read(r: &mut WireReader<'_>) -> ProtocolResult<Self> {
        let app = r.read_cstr()?;
        let outcome = if r.read_bool()? {
            DataOutcome::Granted(r.read_opt_bytes()?)
        } else {
            DataOutcome::Denied {
                retry_after_ms: r.read_u64()?,
            }
        };
        Ok(Self { app, outcome })
    }
}

/// Messages sent by the metaserver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Oids(OidBlock),
    Object(DataResponse),
    /// Granted data is the bound oid as 8 big-endian bytes.
    Binding(DataResponse),
    /// Granted data is the next binding name.
    NextBinding(DataResponse),
    Changeset { app: String, accepted: bool },
}

impl Response {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Oids(_) => opcode::OIDS_RESPONSE,
            Self::Object(_) => opcode::OBJECT_RESPONSE,
            Self::Binding(_) => opcode::BINDING_RESPONSE,
            Self::NextBinding(_) => opcode::NEXT_BINDING_RESPONSE,
            Self::Changeset { .. } => opcode::CHANGESET_RESPONSE,
        }
    }

    pub fn type_name(&self) -> &'static str {
        opcode::name(self.opcode())
    }

    pub fn encode(&self) -> ProtocolResult<BytesMut> {
        encode_frame(self.opcode(), |buf| match self {
            Self::Oids(block) => {
                put_oid(buf, block.start);
                buf.extend_from_slice(&block.size.to_be_bytes());
                Ok(())
            }
            Self::Object(data) | Self::Binding(data) | Self::NextBinding(data) => data.write(buf),
            Self::Changeset { app, accepted } => {
                put_cstr(buf, app)?;
                put_bool(buf, *accepted);
                Ok(())
            }
        })
    }

    pub fn decode(frame: &Frame) -> ProtocolResult<Self> {
        let mut r = WireReader::new(&frame.payload);
        let response = match frame.opcode {
            opcode::OIDS_RESPONSE => {
                let start = r.read_oid()?;
                let size = r.read_u64()?;
                let block = OidBlock::new(start, size).map_err(|_| ProtocolError::Truncated("oid block"))?;
                Self::Oids(block)
            }
            opcode::OBJECT_RESPONSE => Self::Object(DataResponse::read(&mut r)?),
            opcode::BINDING_RESPONSE => Self::Binding(DataResponse::read(&mut r)?),
            opcode::NEXT_BINDING_RESPONSE => Self::NextBinding(DataResponse::read(&mut r)?),
            opcode::CHANGESET_RESPONSE => Self::Changeset {
                app: r.read_cstr()?,
                accepted: r.read_bool()?,
            },
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok(response)
    }
}

/// Encode a bound oid for a binding response.
pub fn encode_binding_oid(oid: Oid) -> Vec<u8> {
    oid.to_key().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::next_frame;

    fn reencode_request(request: &Request) -> Request {
        let mut buf = request.encode().unwrap();
        let frame = next_frame(&mut buf).unwrap();
        assert!(buf.is_empty());
        Request::decode(&frame).unwrap()
    }

    #[test]
    fn request_object_layout() {
        let request = Request::RequestObject {
            app: "mw".into(),
            oid: Oid::new(42),
            for_write: true,
        };
        let buf = request.encode().unwrap();
        assert_eq!(
            &buf[..],
            &[0x00, 0x0c, 0x21, b'm', b'w', 0, 1, 0, 0, 0, 0, 0, 0, 0, 42]
        );
    }

    #[test]
    fn login_empty_url_means_none() {
        let request = Request::Login {
            version: PROTOCOL_VERSION,
            admin_url: None,
        };
        assert_eq!(reencode_request(&request), request);
        let with_url = Request::Login {
            version: PROTOCOL_VERSION,
            admin_url: Some("http://node-1:8080".into()),
        };
        assert_eq!(reencode_request(&with_url), with_url);
    }

    #[test]
    fn changeset_preserves_order_and_deletes() {
        let mut changeset = Changeset::new("mw");
        changeset
            .write_object(Oid::new(1), vec![1, 2, 3])
            .delete_object(Oid::new(2))
            .bind("player.ada", Oid::new(1))
            .unbind("player.bob");
        let request = Request::SubmitChangeset(changeset);
        assert_eq!(reencode_request(&request), request);
    }

    #[test]
    fn range_release_with_open_bounds() {
        let request = Request::ReleaseBindingRange {
            app: "mw".into(),
            from: None,
            to: Some("m".into()),
        };
        assert_eq!(reencode_request(&request), request);
    }

    #[test]
    fn truncated_payload_is_rejected_whole() {
        let mut buf = Request::RequestBinding {
            app: "mw".into(),
            name: "ada".into(),
            for_write: false,
        }
        .encode()
        .unwrap();
        let mut frame = next_frame(&mut buf).unwrap();
        frame.payload = frame.payload.slice(..frame.payload.len() - 1);
        assert!(matches!(Request::decode(&frame), Err(ProtocolError::Truncated(_))));
    }

    #[test]
    fn unknown_opcode() {
        let frame = Frame {
            opcode: 0x99,
            payload: bytes::Bytes::new(),
        };
        assert!(matches!(Request::decode(&frame), Err(ProtocolError::UnknownOpcode(0x99))));
        assert!(matches!(Response::decode(&frame), Err(ProtocolError::UnknownOpcode(0x99))));
    }

    #[test]
    fn data_responses_roundtrip() {
        let responses = vec![
            Response::Oids(OidBlock::new(Oid::new(100), 100).unwrap()),
            Response::Object(DataResponse::granted("mw", Some(vec![5; 4]))),
            Response::Object(DataResponse::granted("mw", None)),
            Response::Binding(DataResponse::denied("mw", 250)),
            Response::NextBinding(DataResponse::granted("mw", Some(b"player.bob".to_vec()))),
            Response::Changeset {
                app: "mw".into(),
                accepted: false,
            },
        ];
        for response in responses {
            let mut buf = response.encode().unwrap();
            let frame = next_frame(&mut buf).unwrap();
            assert_eq!(frame.opcode, response.opcode());
            assert_eq!(Response::decode(&frame).unwrap(), response);
        }
    }

    #[test]
    fn only_queries_expect_responses() {
        assert!(Request::RequestOids { app: "mw".into() }.expects_response());
        assert!(!Request::ReleaseObject {
            app: "mw".into(),
            oid: Oid::new(1)
        }
        .expects_response());
    }
}
