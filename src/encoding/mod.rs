//! # Encoding Module
//!
//! Encoding utilities for tidepool's on-disk snapshot format:
//!
//! - **Varint encoding**: base-128 length prefixes for record framing

pub mod varint;

pub use varint::{decode_varint, encode_varint, varint_len};
