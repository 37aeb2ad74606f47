//! Wire message catalogue.
//!
//! Protobuf messages encoded with `prost`. Field 1 of every message is the
//! fixed32 message identifier (see [`identifier`](super::identifier)), so any
//! frame can be decoded as a [`Header`] first.

use bytes::Bytes;

/// Peek-only view shared by every message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Header {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreatePort {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(string, tag = "4")]
    pub port_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreatePortResponse {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub port_id: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestModule {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub port_id: u32,
    #[prost(string, tag = "4")]
    pub module_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestModuleResponse {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub port_id: u32,
    #[prost(message, repeated, tag = "5")]
    pub procedures: Vec<ModuleProcedure>,
}

/// One `(id, name)` entry of a loaded module.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ModuleProcedure {
    #[prost(fixed32, tag = "1")]
    pub procedure_id: u32,
    #[prost(string, tag = "2")]
    pub procedure_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DestroyPort {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub port_id: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub port_id: u32,
    #[prost(fixed32, tag = "4")]
    pub procedure_id: u32,
    #[prost(bytes = "bytes", tag = "6")]
    pub payload: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(bytes = "bytes", tag = "6")]
    pub payload: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoteError {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub error_code: u32,
    #[prost(string, tag = "3")]
    pub error_message: String,
}

/// Stream chunk, close frame and ack share this layout.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamMessage {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub port_id: u32,
    #[prost(fixed32, tag = "4")]
    pub sequence_id: u32,
    #[prost(bytes = "bytes", tag = "6")]
    pub payload: Bytes,
    #[prost(bool, tag = "7")]
    pub closed: bool,
    #[prost(bool, tag = "8")]
    pub ack: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerReady {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
}
