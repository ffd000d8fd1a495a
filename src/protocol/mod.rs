//! xrpc protocol core implementation
//!
//! This module provides the wire header, the handshake option, the codec
//! abstraction and the shared error type.

pub mod codec;
mod error;
mod header;
pub(crate) mod metrics;
mod option;
mod types;

pub use codec::{
    BoxedReader, BoxedWriter, CodecHalves, FrameReader, FrameWriter, JsonCodec, JsonReader,
    JsonWriter, NewCodecFunc, new_codec_func,
};
pub use error::{Error, Result};
pub use header::Header;
pub use metrics::{MetricsSnapshot, snapshot};
pub use option::{Options, read_options, write_options};
pub use types::CodecType;

/// xrpc magic number, sent first on every connection
pub const MAGIC_NUMBER: u64 = 0x003b_ef5c;

/// Maximum size of a single encoded header or body (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Codec used when the caller does not pick one
pub const DEFAULT_CODEC: CodecType = CodecType::Json;
