//! Wire protocol between Keystone nodes and the metaserver.
//!
//! Every message travels in a frame of `[2-byte BE length][1-byte opcode]
//! [payload]`, where the length counts the payload bytes after the opcode.
//! Payload fields are fixed-width big-endian integers, NUL-terminated
//! strings, and 2-byte length-prefixed byte strings (see [`wire`]).
//!
//! The node side talks to the metaserver through the async [`DataClient`].
//! [`RemoteStorageEngine`] runs the data layer's transactions against the
//! metaserver's canonical store over a [`BlockingDataClient`], taking
//! metaserver locks as it reads and writes and committing by changeset;
//! [`RemoteOidStrategy`] draws oid blocks from the same connection.

pub mod client;
pub mod codec;
pub mod engine;
pub mod error;
pub mod message;
pub mod opcode;
pub mod remote;
pub mod wire;

pub use client::{decode_binding_oid, DataClient};
pub use engine::{RemoteStorageEngine, RemoteTransaction};
pub use codec::{can_dispatch, dispatch, encode_frame, next_frame, Frame, HEADER_LEN, MAX_PAYLOAD};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{DataOutcome, DataResponse, Request, Response, PROTOCOL_VERSION};
pub use remote::{BlockingDataClient, RemoteOidStrategy};
