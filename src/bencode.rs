//! Bencode codec used for KRPC envelopes.
//!
//! Every datagram exchanged between DHT nodes is a single bencoded
//! dictionary. This module provides the [`Value`] tree together with
//! [`encode`] and [`decode`]; the KRPC layer treats them as an opaque pair.
//!
//! # Examples
//!
//! ```
//! use rdht::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d1:t1:a1:y1:qe").unwrap();
//! assert_eq!(value.get(b"y").and_then(Value::as_str), Some("q"));
//! assert_eq!(encode(&value), b"d1:t1:a1:y1:qe");
//! ```
//!
//! Malformed input is reported as a [`BencodeError`]; the decoder never
//! panics on untrusted bytes and refuses nesting deeper than 64 levels.

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::encode;
pub use error::BencodeError;
pub use value::{Dict, Value};

#[cfg(test)]
mod tests;
