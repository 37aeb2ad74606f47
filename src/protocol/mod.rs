//! Protocol module - message identifiers, wire messages and frame parsing.
//!
//! This module implements the wire protocol:
//! - 4-bit kind / 27-bit number identifier packed in a fixed32
//! - Protobuf message catalogue (`prost`)
//! - Header peek followed by kind-specific decode

mod identifier;
mod messages;

pub mod frame;

pub use frame::{encode, parse_message, peek_identifier, Frame, ProtocolMessage};
pub use identifier::{
    pack, unpack, MessageIdentifier, MessageKind, MAX_MESSAGE_NUMBER, MESSAGE_NUMBER_BITS,
    MESSAGE_NUMBER_MASK,
};
pub use messages::{
    CreatePort, CreatePortResponse, DestroyPort, Header, ModuleProcedure, RemoteError, Request,
    RequestModule, RequestModuleResponse, Response, ServerReady, StreamMessage,
};
