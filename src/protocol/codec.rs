//! xrpc frame codec
//!
//! A frame is a header followed by a body, each encoded independently so the
//! receiver can read the header, decide where the body goes, and only then
//! read (or skip) the body. A codec is split into a read half and a write half
//! so one task can read responses while others write requests.

use std::collections::HashMap;
use std::io;
use std::sync::LazyLock;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use super::{CodecType, Error, Header, MAX_FRAME_SIZE, Result};

/// Buffered read half of a connection
pub type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// Write half of a connection
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read side of a codec
#[async_trait]
pub trait FrameReader: Send {
    /// Read the next header
    async fn read_header(&mut self) -> Result<Header>;

    /// Read the body that follows the last header, still encoded
    async fn read_body(&mut self) -> Result<Bytes>;

    /// Skip the body that follows the last header
    async fn discard_body(&mut self) -> Result<()> {
        self.read_body().await.map(drop)
    }
}

/// Write side of a codec
#[async_trait]
pub trait FrameWriter: Send {
    /// Write a header and an encoded body as one frame, then flush
    ///
    /// On any error the underlying stream is closed: a partial frame cannot
    /// be recovered from.
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()>;

    /// Close the underlying stream
    async fn close(&mut self) -> Result<()>;
}

/// Both halves of a codec bound to one connection
pub type CodecHalves = (Box<dyn FrameReader>, Box<dyn FrameWriter>);

/// Constructor stored in the codec table
pub type NewCodecFunc = fn(BoxedReader, BoxedWriter) -> CodecHalves;

/// Codec table; a new codec adds its `CodecType` variant and an entry here.
static CODECS: LazyLock<HashMap<CodecType, NewCodecFunc>> = LazyLock::new(|| {
    let mut codecs: HashMap<CodecType, NewCodecFunc> = HashMap::new();
    codecs.insert(CodecType::Json, JsonCodec::new_boxed);
    codecs
});

/// Look up the constructor for a codec type
#[must_use]
pub fn new_codec_func(codec: CodecType) -> Option<NewCodecFunc> {
    CODECS.get(&codec).copied()
}

/// Newline-delimited JSON codec
///
/// # Format
///
/// ```text
/// [HEADER JSON]\n[BODY JSON]\n
/// ```
pub struct JsonCodec;

impl JsonCodec {
    /// Build both halves over the given stream halves
    #[must_use]
    pub fn new<R, W>(reader: R, writer: W) -> (JsonReader<R>, JsonWriter<W>)
    where
        R: AsyncBufRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        (JsonReader::new(reader), JsonWriter::new(writer))
    }

    fn new_boxed(reader: BoxedReader, writer: BoxedWriter) -> CodecHalves {
        let (reader, writer) = Self::new(reader, writer);
        (Box::new(reader), Box::new(writer))
    }
}

/// Read half of [`JsonCodec`]
pub struct JsonReader<R> {
    reader: R,
}

impl<R> JsonReader<R>
where
    R: AsyncBufRead + Send + Unpin,
{
    /// Wrap a buffered reader
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R> FrameReader for JsonReader<R>
where
    R: AsyncBufRead + Send + Unpin,
{
    async fn read_header(&mut self) -> Result<Header> {
        let line = read_line(&mut self.reader).await?;
        Ok(serde_json::from_slice(&line)?)
    }

    async fn read_body(&mut self) -> Result<Bytes> {
        read_line(&mut self.reader).await
    }
}

/// Write half of [`JsonCodec`]
pub struct JsonWriter<W>
where
    W: AsyncWrite,
{
    writer: BufWriter<W>,
    closed: bool,
}

impl<W> JsonWriter<W>
where
    W: AsyncWrite + Send + Unpin,
{
    /// Wrap a writer in a buffered frame writer
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            closed: false,
        }
    }

    /// Access the underlying writer
    pub fn get_ref(&self) -> &W {
        self.writer.get_ref()
    }

    async fn write_frame(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Shutdown);
        }

        let header_bytes = serde_json::to_vec(header)?;
        for size in [header_bytes.len(), body.len()] {
            if size > MAX_FRAME_SIZE {
                return Err(Error::FrameTooLarge {
                    size,
                    max: MAX_FRAME_SIZE,
                });
            }
        }
        if body.contains(&b'\n') {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "body contains a line break",
            )));
        }

        self.writer.write_all(&header_bytes).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.write_all(body).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W> FrameWriter for JsonWriter<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let result = self.write_frame(header, body).await;
        if let Err(err) = &result {
            warn!(seq = header.seq, service_method = %header.service_method, error = %err, "frame write failed; closing stream");
            let _ = self.close().await;
        }
        result
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("closing json codec");
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Read one newline-terminated line, without the newline
pub(crate) async fn read_line<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = Vec::new();
    let limit = (MAX_FRAME_SIZE + 1) as u64;
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Err(Error::UnexpectedEof);
    }

    if line.last() == Some(&b'\n') {
        line.pop();
        return Ok(Bytes::from(line));
    }
    if line.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: line.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Err(Error::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    async fn encode_frames(frames: &[(Header, Bytes)]) -> Vec<u8> {
        let mut writer = JsonWriter::new(Vec::new());
        for (header, body) in frames {
            writer.write(header, body).await.unwrap();
        }
        writer.get_ref().clone()
    }

    #[tokio::test]
    async fn test_write_read_frame() {
        let header = Header::new("Arith.Sum", 1);
        let body = CodecType::Json.encode(&Args { num1: 2, num2: 3 }).unwrap();
        let wire = encode_frames(&[(header.clone(), body)]).await;

        let mut reader = JsonReader::new(wire.as_slice());
        assert_eq!(reader.read_header().await.unwrap(), header);
        let body = reader.read_body().await.unwrap();
        let args: Args = CodecType::Json.decode(&body).unwrap();
        assert_eq!(args, Args { num1: 2, num2: 3 });
    }

    #[tokio::test]
    async fn test_discard_body_keeps_alignment() {
        let first = Header::new("Arith.Sum", 1);
        let second = Header::new("Arith.Mul", 2);
        let body = CodecType::Json.encode(&Args { num1: 1, num2: 1 }).unwrap();
        let wire = encode_frames(&[(first, body.clone()), (second.clone(), body)]).await;

        let mut reader = JsonReader::new(wire.as_slice());
        reader.read_header().await.unwrap();
        reader.discard_body().await.unwrap();
        assert_eq!(reader.read_header().await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_end_of_stream() {
        let mut reader = JsonReader::new(&b""[..]);
        assert!(matches!(reader.read_header().await, Err(Error::UnexpectedEof)));

        let mut reader = JsonReader::new(&br#"{"ServiceMethod":"A.B""#[..]);
        assert!(matches!(reader.read_header().await, Err(Error::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_garbage_header_is_codec_error() {
        let mut reader = JsonReader::new(&b"not json\n"[..]);
        assert!(matches!(reader.read_header().await, Err(Error::Codec(_))));
    }

    #[tokio::test]
    async fn test_write_after_failure_is_rejected() {
        let mut writer = JsonWriter::new(Vec::new());
        let header = Header::new("Arith.Sum", 1);
        assert!(writer.write(&header, b"{\n}").await.is_err());
        assert!(matches!(
            writer.write(&header, b"{}").await,
            Err(Error::Shutdown)
        ));
    }

    #[test]
    fn test_registry_has_json() {
        assert!(new_codec_func(CodecType::Json).is_some());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn runtime() -> tokio::runtime::Runtime {
            tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap()
        }

        proptest! {
            /// Property: any header and body survive a write/read cycle
            #[test]
            fn prop_frame_roundtrip(
                service_method in ".*",
                seq in any::<u64>(),
                error in ".*",
                values in prop::collection::vec(any::<i64>(), 0..64),
                text in ".*",
            ) {
                let header = Header { service_method, seq, error };
                let body_value = (values, text);
                let body = CodecType::Json.encode(&body_value).unwrap();

                let (decoded_header, decoded_body) = runtime().block_on(async {
                    let wire = encode_frames(&[(header.clone(), body)]).await;
                    let mut reader = JsonReader::new(wire.as_slice());
                    let h = reader.read_header().await.unwrap();
                    let b = reader.read_body().await.unwrap();
                    (h, b)
                });

                prop_assert_eq!(decoded_header, header);
                let decoded: (Vec<i64>, String) = CodecType::Json.decode(&decoded_body).unwrap();
                prop_assert_eq!(decoded, body_value);
            }
        }
    }
}
