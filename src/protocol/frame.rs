//! Typed frames and frame builders.
//!
//! Parsing is a single linear pass: decode the [`Header`] to learn the kind,
//! then decode the full message with the kind-specific type.
//!
//! # Example
//!
//! ```
//! use portrpc::protocol::{encode, parse_message, MessageKind, ProtocolMessage};
//! use portrpc::protocol::frame::create_port;
//!
//! let bytes = encode(&create_port(7, "books"));
//! let frame = parse_message(bytes).unwrap();
//!
//! assert_eq!(frame.kind(), MessageKind::CreatePort);
//! assert_eq!(frame.number(), 7);
//! assert!(matches!(frame.message, ProtocolMessage::CreatePort(ref m) if m.port_name == "books"));
//! ```

use bytes::Bytes;
use prost::Message;

use super::identifier::{pack, MessageIdentifier, MessageKind};
use super::messages::{
    CreatePort, CreatePortResponse, DestroyPort, Header, ModuleProcedure, RemoteError, Request,
    RequestModule, RequestModuleResponse, Response, ServerReady, StreamMessage,
};
use crate::error::{Result, RpcError};

/// A decoded message of any kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Request(Request),
    Response(Response),
    StreamMessage(StreamMessage),
    StreamAck(StreamMessage),
    CreatePort(CreatePort),
    CreatePortResponse(CreatePortResponse),
    RequestModule(RequestModule),
    RequestModuleResponse(RequestModuleResponse),
    RemoteError(RemoteError),
    DestroyPort(DestroyPort),
    ServerReady(ServerReady),
}

/// A complete inbound frame: identifier plus decoded message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Identifier read from the header.
    pub id: MessageIdentifier,
    /// Kind-specific message.
    pub message: ProtocolMessage,
}

impl Frame {
    /// Message kind.
    #[inline]
    pub fn kind(&self) -> MessageKind {
        self.id.kind
    }

    /// Message number.
    #[inline]
    pub fn number(&self) -> u32 {
        self.id.number
    }
}

/// Decode only the identifier of an encoded message.
pub fn peek_identifier(data: &[u8]) -> Result<MessageIdentifier> {
    let header = Header::decode(data)?;
    MessageIdentifier::decode(header.message_identifier)
}

/// Decode an encoded message into a typed [`Frame`].
///
/// `EMPTY` and unknown kinds are protocol errors.
pub fn parse_message(data: Bytes) -> Result<Frame> {
    let id = peek_identifier(&data)?;
    let message = match id.kind {
        MessageKind::Request => ProtocolMessage::Request(Request::decode(data)?),
        MessageKind::Response => ProtocolMessage::Response(Response::decode(data)?),
        MessageKind::StreamMessage => {
            ProtocolMessage::StreamMessage(StreamMessage::decode(data)?)
        }
        MessageKind::StreamAck => ProtocolMessage::StreamAck(StreamMessage::decode(data)?),
        MessageKind::CreatePort => ProtocolMessage::CreatePort(CreatePort::decode(data)?),
        MessageKind::CreatePortResponse => {
            ProtocolMessage::CreatePortResponse(CreatePortResponse::decode(data)?)
        }
        MessageKind::RequestModule => {
            ProtocolMessage::RequestModule(RequestModule::decode(data)?)
        }
        MessageKind::RequestModuleResponse => {
            ProtocolMessage::RequestModuleResponse(RequestModuleResponse::decode(data)?)
        }
        MessageKind::RemoteErrorResponse => {
            ProtocolMessage::RemoteError(RemoteError::decode(data)?)
        }
        MessageKind::DestroyPort => ProtocolMessage::DestroyPort(DestroyPort::decode(data)?),
        MessageKind::ServerReady => ProtocolMessage::ServerReady(ServerReady::decode(data)?),
        MessageKind::Empty => return Err(RpcError::UnknownMessageKind(MessageKind::Empty as u8)),
    };
    Ok(Frame { id, message })
}

/// Encode a message into a freshly allocated buffer.
#[inline]
pub fn encode<M: Message>(message: &M) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

#[inline]
fn identifier(kind: MessageKind, number: u32) -> u32 {
    pack(kind as u8, number)
}

/// Build a `CreatePort` request.
pub fn create_port(number: u32, port_name: &str) -> CreatePort {
    CreatePort {
        message_identifier: identifier(MessageKind::CreatePort, number),
        port_name: port_name.to_string(),
    }
}

/// Build a `CreatePortResponse`.
pub fn create_port_response(number: u32, port_id: u32) -> CreatePortResponse {
    CreatePortResponse {
        message_identifier: identifier(MessageKind::CreatePortResponse, number),
        port_id,
    }
}

/// Build a `RequestModule` request.
pub fn request_module(number: u32, port_id: u32, module_name: &str) -> RequestModule {
    RequestModule {
        message_identifier: identifier(MessageKind::RequestModule, number),
        port_id,
        module_name: module_name.to_string(),
    }
}

/// Build a `RequestModuleResponse` from `(id, name)` pairs.
pub fn request_module_response(
    number: u32,
    port_id: u32,
    procedures: impl IntoIterator<Item = (u32, String)>,
) -> RequestModuleResponse {
    RequestModuleResponse {
        message_identifier: identifier(MessageKind::RequestModuleResponse, number),
        port_id,
        procedures: procedures
            .into_iter()
            .map(|(procedure_id, procedure_name)| ModuleProcedure {
                procedure_id,
                procedure_name,
            })
            .collect(),
    }
}

/// Build a `DestroyPort` notification.
pub fn destroy_port(number: u32, port_id: u32) -> DestroyPort {
    DestroyPort {
        message_identifier: identifier(MessageKind::DestroyPort, number),
        port_id,
    }
}

/// Build a procedure `Request`.
pub fn request(number: u32, port_id: u32, procedure_id: u32, payload: Bytes) -> Request {
    Request {
        message_identifier: identifier(MessageKind::Request, number),
        port_id,
        procedure_id,
        payload,
    }
}

/// Build a unary `Response`.
pub fn response(number: u32, payload: Bytes) -> Response {
    Response {
        message_identifier: identifier(MessageKind::Response, number),
        payload,
    }
}

/// Build a `RemoteErrorResponse` with error code 0.
pub fn remote_error(number: u32, message: impl Into<String>) -> RemoteError {
    RemoteError {
        message_identifier: identifier(MessageKind::RemoteErrorResponse, number),
        error_code: 0,
        error_message: message.into(),
    }
}

/// Build a stream data chunk.
pub fn stream_chunk(number: u32, port_id: u32, sequence_id: u32, payload: Bytes) -> StreamMessage {
    StreamMessage {
        message_identifier: identifier(MessageKind::StreamMessage, number),
        port_id,
        sequence_id,
        payload,
        closed: false,
        ack: false,
    }
}

/// Build a stream close frame.
pub fn close_stream(number: u32, port_id: u32, sequence_id: u32) -> StreamMessage {
    StreamMessage {
        message_identifier: identifier(MessageKind::StreamMessage, number),
        port_id,
        sequence_id,
        payload: Bytes::new(),
        closed: true,
        ack: false,
    }
}

/// Build the ack for one received chunk.
pub fn stream_ack(number: u32, port_id: u32, sequence_id: u32) -> StreamMessage {
    StreamMessage {
        message_identifier: identifier(MessageKind::StreamAck, number),
        port_id,
        sequence_id,
        payload: Bytes::new(),
        closed: false,
        ack: true,
    }
}

/// Build the `ServerReady` greeting.
pub fn server_ready() -> ServerReady {
    ServerReady {
        message_identifier: identifier(MessageKind::ServerReady, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_reads_only_identifier() {
        let bytes = encode(&request(12, 3, 4, Bytes::from_static(b"payload")));
        let id = peek_identifier(&bytes).unwrap();
        assert_eq!(id.kind, MessageKind::Request);
        assert_eq!(id.number, 12);
    }

    #[test]
    fn test_parse_request() {
        let bytes = encode(&request(12, 3, 4, Bytes::from_static(b"payload")));
        let frame = parse_message(bytes).unwrap();

        match frame.message {
            ProtocolMessage::Request(req) => {
                assert_eq!(req.port_id, 3);
                assert_eq!(req.procedure_id, 4);
                assert_eq!(&req.payload[..], b"payload");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_parse_distinguishes_ack_from_chunk() {
        let chunk = parse_message(encode(&stream_chunk(5, 1, 0, Bytes::from_static(b"a")))).unwrap();
        let ack = parse_message(encode(&stream_ack(5, 1, 0))).unwrap();
        let close = parse_message(encode(&close_stream(5, 1, 2))).unwrap();

        assert_eq!(chunk.kind(), MessageKind::StreamMessage);
        assert_eq!(ack.kind(), MessageKind::StreamAck);
        assert!(matches!(ack.message, ProtocolMessage::StreamAck(ref m) if m.ack && !m.closed));
        assert!(matches!(close.message, ProtocolMessage::StreamMessage(ref m) if m.closed));
    }

    #[test]
    fn test_parse_module_response() {
        let msg = request_module_response(
            9,
            1,
            vec![(1, "getBook".to_string()), (2, "queryBooks".to_string())],
        );
        let frame = parse_message(encode(&msg)).unwrap();
        match frame.message {
            ProtocolMessage::RequestModuleResponse(resp) => {
                assert_eq!(resp.procedures.len(), 2);
                assert_eq!(resp.procedures[1].procedure_id, 2);
                assert_eq!(resp.procedures[1].procedure_name, "queryBooks");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_parse_remote_error() {
        let frame = parse_message(encode(&remote_error(4, "boom"))).unwrap();
        assert_eq!(frame.kind(), MessageKind::RemoteErrorResponse);
        assert!(matches!(
            frame.message,
            ProtocolMessage::RemoteError(ref e) if e.error_message == "boom" && e.error_code == 0
        ));
    }

    #[test]
    fn test_server_ready_has_only_identifier() {
        let bytes = encode(&server_ready());
        // fixed32 tag byte + 4 bytes
        assert_eq!(bytes.len(), 5);
        let frame = parse_message(bytes).unwrap();
        assert_eq!(frame.kind(), MessageKind::ServerReady);
    }

    #[test]
    fn test_empty_kind_rejected() {
        let bytes = encode(&Header {
            message_identifier: pack(0, 1),
        });
        assert!(matches!(
            parse_message(bytes),
            Err(RpcError::UnknownMessageKind(0))
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let bytes = encode(&Header {
            message_identifier: pack(14, 1),
        });
        assert!(matches!(
            parse_message(bytes),
            Err(RpcError::UnknownMessageKind(14))
        ));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let result = parse_message(Bytes::from_static(&[0xFF, 0xFF, 0xFF]));
        assert!(result.is_err());
    }
}
