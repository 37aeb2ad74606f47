//! Codec module - serialization/deserialization for procedure payloads.
//!
//! This module provides codecs for encoding/decoding request and response
//! payloads carried inside `Request`, `Response` and `StreamMessage` frames:
//!
//! - [`ProstCodec`] - Protobuf messages using `prost`
//!
//! Raw procedures skip the codec entirely and see the payload `Bytes` as sent.
//!
//! # Design
//!
//! Codecs are implemented as marker structs with static methods rather than trait objects.
//! The protocol engine itself never looks inside payloads; only typed procedure
//! registrations and typed client calls go through a codec.
//!
//! # Example
//!
//! ```
//! use portrpc::codec::ProstCodec;
//!
//! let encoded = ProstCodec::encode(&"hello".to_string());
//! let decoded: String = ProstCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod protobuf;

pub use protobuf::ProstCodec;
