//! Frame opcodes.

pub const LOGIN: u8 = 0x10;

pub const REQUEST_OIDS: u8 = 0x20;
pub const REQUEST_OBJECT: u8 = 0x21;
pub const REQUEST_BINDING: u8 = 0x22;
pub const REQUEST_NEXT_BINDING: u8 = 0x23;

pub const SUBMIT_CHANGESET: u8 = 0x30;

pub const RELEASE_OBJECT: u8 = 0x40;
pub const RELEASE_BINDING: u8 = 0x41;
pub const RELEASE_BINDING_RANGE: u8 = 0x42;

pub const OIDS_RESPONSE: u8 = 0x50;
pub const OBJECT_RESPONSE: u8 = 0x51;
pub const BINDING_RESPONSE: u8 = 0x52;
pub const NEXT_BINDING_RESPONSE: u8 = 0x53;
pub const CHANGESET_RESPONSE: u8 = 0x54;

/// Human-readable name for logs.
pub fn name(opcode: u8) -> &'static str {
    match opcode {
        LOGIN => "LOGIN",
        REQUEST_OIDS => "REQUEST_OIDS",
        REQUEST_OBJECT => "REQUEST_OBJECT",
        REQUEST_BINDING => "REQUEST_BINDING",
        REQUEST_NEXT_BINDING => "REQUEST_NEXT_BINDING",
        SUBMIT_CHANGESET => "SUBMIT_CHANGESET",
        RELEASE_OBJECT => "RELEASE_OBJECT",
        RELEASE_BINDING => "RELEASE_BINDING",
        RELEASE_BINDING_RANGE => "RELEASE_BINDING_RANGE",
        OIDS_RESPONSE => "OIDS_RESPONSE",
        OBJECT_RESPONSE => "OBJECT_RESPONSE",
        BINDING_RESPONSE => "BINDING_RESPONSE",
        NEXT_BINDING_RESPONSE => "NEXT_BINDING_RESPONSE",
        CHANGESET_RESPONSE => "CHANGESET_RESPONSE",
        _ => "UNKNOWN",
    }
}
