//! Connection handshake
//!
//! The initiator writes one `Options` value as a JSON line before any framed
//! traffic. It is always JSON, whatever codec it selects, so the acceptor can
//! read it before a codec exists.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::codec::read_line;
use super::{CodecType, DEFAULT_CODEC, Error, MAGIC_NUMBER, Result};

/// Handshake value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// Must equal [`MAGIC_NUMBER`]
    #[serde(rename = "MagicNumber")]
    pub magic_number: u64,
    /// Tag of the codec used for every later frame
    #[serde(rename = "CodecType")]
    pub codec_type: String,
}

impl Options {
    /// Options selecting the given codec
    #[must_use]
    pub fn with_codec(codec: CodecType) -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: codec.as_tag().to_string(),
        }
    }

    /// Check the magic number and resolve the codec
    pub fn validate(&self) -> Result<CodecType> {
        if self.magic_number != MAGIC_NUMBER {
            return Err(Error::InvalidMagic {
                found: self.magic_number,
            });
        }
        CodecType::from_tag(&self.codec_type).ok_or_else(|| Error::UnknownCodec {
            tag: self.codec_type.clone(),
        })
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::with_codec(DEFAULT_CODEC)
    }
}

/// Write the handshake and flush it
pub async fn write_options<W>(writer: &mut W, options: &Options) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut line = serde_json::to_vec(options)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    debug!(codec = %options.codec_type, "handshake sent");
    Ok(())
}

/// Read a handshake
///
/// Only decodes; call [`Options::validate`] before trusting it.
pub async fn read_options<R>(reader: &mut R) -> Result<Options>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let line = read_line(reader).await?;
    Ok(serde_json::from_slice(&line)?)
}
