//! Protobuf codec using `prost`.
//!
//! Procedure arguments and results are protobuf messages. An encoded message
//! may legitimately be zero bytes long (all fields at their defaults), so the
//! codec never treats an empty buffer as "no value".
//!
//! # Example
//!
//! ```
//! use portrpc::codec::ProstCodec;
//!
//! #[derive(Clone, PartialEq, prost::Message)]
//! struct Book {
//!     #[prost(string, tag = "1")]
//!     author: String,
//!     #[prost(int64, tag = "2")]
//!     isbn: i64,
//! }
//!
//! let book = Book { author: "menduz".to_string(), isbn: 19997 };
//! let encoded = ProstCodec::encode(&book);
//! let decoded: Book = ProstCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, book);
//! ```

use bytes::Bytes;
use prost::Message;

use crate::error::Result;

/// Protobuf codec for structured payloads.
pub struct ProstCodec;

impl ProstCodec {
    /// Encode a message into a fresh buffer.
    #[inline]
    pub fn encode<T: Message>(value: &T) -> Bytes {
        Bytes::from(value.encode_to_vec())
    }

    /// Decode a message from bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a valid encoding of `T`.
    #[inline]
    pub fn decode<T: Message + Default>(bytes: &[u8]) -> Result<T> {
        Ok(T::decode(bytes)?)
    }
}
