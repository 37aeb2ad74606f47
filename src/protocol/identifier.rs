//! Message identifier packing.
//!
//! Every message starts with a fixed32 field that packs the message kind
//! and the message number:
//! ```text
//! ┌──────┬────────┬──────────────────────────────┐
//! │ 0    │ Kind   │ Message number               │
//! │ 1 bit│ 4 bits │ 27 bits                      │
//! └──────┴────────┴──────────────────────────────┘
//! ```
//!
//! The receiver reads only this field to decide how to parse the rest.

use crate::error::{Result, RpcError};

/// Bits used by the message number.
pub const MESSAGE_NUMBER_BITS: u32 = 27;

/// Mask for the message number half of the identifier.
pub const MESSAGE_NUMBER_MASK: u32 = (1 << MESSAGE_NUMBER_BITS) - 1;

/// Largest message number that fits in an identifier.
pub const MAX_MESSAGE_NUMBER: u32 = MESSAGE_NUMBER_MASK;

/// Mask for the 4-bit kind.
const KIND_MASK: u32 = 0xF;

/// Message kinds carried in the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Empty = 0,
    Request = 1,
    Response = 2,
    StreamMessage = 3,
    StreamAck = 4,
    CreatePort = 5,
    CreatePortResponse = 6,
    RequestModule = 7,
    RequestModuleResponse = 8,
    RemoteErrorResponse = 9,
    DestroyPort = 10,
    ServerReady = 11,
}

impl TryFrom<u8> for MessageKind {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageKind::Empty),
            1 => Ok(MessageKind::Request),
            2 => Ok(MessageKind::Response),
            3 => Ok(MessageKind::StreamMessage),
            4 => Ok(MessageKind::StreamAck),
            5 => Ok(MessageKind::CreatePort),
            6 => Ok(MessageKind::CreatePortResponse),
            7 => Ok(MessageKind::RequestModule),
            8 => Ok(MessageKind::RequestModuleResponse),
            9 => Ok(MessageKind::RemoteErrorResponse),
            10 => Ok(MessageKind::DestroyPort),
            11 => Ok(MessageKind::ServerReady),
            other => Err(RpcError::UnknownMessageKind(other)),
        }
    }
}

/// Pack a raw kind and number into an identifier.
///
/// Out-of-range bits are masked off.
///
/// # Example
///
/// ```
/// use portrpc::protocol::{pack, unpack};
///
/// let id = pack(3, 42);
/// assert_eq!(unpack(id), (3, 42));
/// ```
#[inline]
pub fn pack(kind: u8, number: u32) -> u32 {
    ((kind as u32 & KIND_MASK) << MESSAGE_NUMBER_BITS) | (number & MESSAGE_NUMBER_MASK)
}

/// Split an identifier into its raw kind and number.
#[inline]
pub fn unpack(identifier: u32) -> (u8, u32) {
    (
        ((identifier >> MESSAGE_NUMBER_BITS) & KIND_MASK) as u8,
        identifier & MESSAGE_NUMBER_MASK,
    )
}

/// Typed view of a message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageIdentifier {
    /// Message kind.
    pub kind: MessageKind,
    /// Message number the frame belongs to.
    pub number: u32,
}

impl MessageIdentifier {
    /// Create a new identifier.
    pub fn new(kind: MessageKind, number: u32) -> Self {
        Self { kind, number }
    }

    /// Pack into the wire representation.
    #[inline]
    pub fn encode(&self) -> u32 {
        pack(self.kind as u8, self.number)
    }

    /// Unpack from the wire representation.
    ///
    /// Fails if the kind is not one of the known message kinds.
    pub fn decode(identifier: u32) -> Result<Self> {
        let (kind, number) = unpack(identifier);
        Ok(Self {
            kind: MessageKind::try_from(kind)?,
            number,
        })
    }
}
