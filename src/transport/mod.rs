//! Encrypted, length-prefixed framing.
//!
//! Wire format: [4-byte big-endian length][sealed payload]
//! where the sealed payload opens to [varint body length][protobuf body].
//! The length header always equals the sealed payload's exact byte count.

pub mod cipher;
pub mod protocol;

pub use cipher::{AesGcmCipher, Cipher, SharedKey};
pub use protocol::{CommandKind, Request, Response};

use std::io;
use std::sync::Arc;

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ChannelError;

/// Size of the length header preceding each frame.
pub const HEADER_SIZE: usize = 4;

/// Default maximum sealed payload size (16 MB). Safety valve against malformed headers.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Body buffer reserved up front; it grows only as payload bytes arrive.
const INITIAL_BODY_CAPACITY: usize = 8 * 1024;

/// Seals messages into frames and opens them again.
#[derive(Clone)]
pub struct FrameCodec {
    cipher: Arc<dyn Cipher>,
    max_frame_size: usize,
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("max_frame_size", &self.max_frame_size)
            .finish_non_exhaustive()
    }
}

impl FrameCodec {
    pub fn new(cipher: Arc<dyn Cipher>) -> Self {
        Self {
            cipher,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Codec backed by AES-256-GCM under `key`.
    pub fn with_key(key: &SharedKey) -> Self {
        Self::new(Arc::new(AesGcmCipher::new(key)))
    }

    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Serialize, seal and length-prefix `message`.
    pub fn encode<M: Message>(&self, message: &M) -> Result<Vec<u8>, ChannelError> {
        let body = message.encode_length_delimited_to_vec();
        let sealed = self.cipher.seal(&body)?;

        let len = u32::try_from(sealed.len()).map_err(|_| ChannelError::FrameTooLarge {
            len: sealed.len(),
            max: self.max_frame_size,
        })?;
        if sealed.len() > self.max_frame_size {
            return Err(ChannelError::FrameTooLarge {
                len: sealed.len(),
                max: self.max_frame_size,
            });
        }

        let mut frame = Vec::with_capacity(HEADER_SIZE + sealed.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Read one frame from `reader` and decode it into `M`.
    pub async fn decode<M, R>(&self, reader: &mut R) -> Result<M, ChannelError>
    where
        M: Message + Default,
        R: AsyncRead + Unpin,
    {
        let sealed = self.read_frame(reader).await?;
        self.open(&sealed)
    }

    /// Read the header and exactly that many payload bytes.
    ///
    /// EOF at any point before the frame is complete yields `ConnectionClosed`.
    pub async fn read_frame<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<Vec<u8>, ChannelError> {
        let mut header = [0u8; HEADER_SIZE];
        read_full(reader, &mut header).await?;

        let declared = u32::from_be_bytes(header);
        let len = declared as usize;
        if len > self.max_frame_size {
            return Err(ChannelError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        let mut sealed = Vec::with_capacity(len.min(INITIAL_BODY_CAPACITY));
        let read = (&mut *reader)
            .take(u64::from(declared))
            .read_to_end(&mut sealed)
            .await?;
        if read < len {
            return Err(ChannelError::ConnectionClosed);
        }
        Ok(sealed)
    }

    /// Open a sealed payload and parse the message inside.
    pub fn open<M: Message + Default>(&self, sealed: &[u8]) -> Result<M, ChannelError> {
        // Nothing below runs unless the cipher authenticated the payload.
        let plaintext = self.cipher.open(sealed)?;

        let mut buf = plaintext.as_slice();
        let body_len = prost::encoding::decode_varint(&mut buf)
            .map_err(|e| ChannelError::FrameMalformed(format!("invalid body length: {e}")))?;
        let body_len = usize::try_from(body_len)
            .map_err(|_| ChannelError::FrameMalformed(format!("body length {body_len} overflows")))?;

        if buf.len() != body_len {
            return Err(ChannelError::FrameMalformed(format!(
                "body length {body_len} does not match {} remaining bytes",
                buf.len()
            )));
        }

        M::decode(buf).map_err(|e| ChannelError::FrameMalformed(e.to_string()))
    }

    /// Encode `message` and write the whole frame. Returns bytes written.
    pub async fn write<M, W>(&self, writer: &mut W, message: &M) -> Result<usize, ChannelError>
    where
        M: Message,
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(message)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(frame.len())
    }
}

async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), ChannelError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ChannelError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::cipher::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

    fn codec() -> FrameCodec {
        FrameCodec::with_key(&SharedKey::new([9u8; KEY_SIZE]))
    }

    fn header_of(frame: &[u8]) -> usize {
        u32::from_be_bytes(frame[..HEADER_SIZE].try_into().unwrap()) as usize
    }

    fn raw_frame(codec_key: &SharedKey, plaintext: &[u8]) -> Vec<u8> {
        let sealed = AesGcmCipher::new(codec_key).seal(plaintext).unwrap();
        let mut frame = (sealed.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&sealed);
        frame
    }

    #[tokio::test]
    async fn roundtrip_request() {
        let codec = codec();
        let req = Request::new(CommandKind::Info, "abc", "test");
        let frame = codec.encode(&req).unwrap();

        let mut cursor = std::io::Cursor::new(frame);
        let decoded: Request = codec.decode(&mut cursor).await.unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.command(), Some(CommandKind::Info));
    }

    #[tokio::test]
    async fn roundtrip_response_with_attributes() {
        let codec = codec();
        let mut resp = Response::for_request("srv", &Request::new(CommandKind::Info, "1", "c"));
        resp.attributes.insert("hostname".into(), "box".into());

        let mut buf = Vec::new();
        let written = codec.write(&mut buf, &resp).await.unwrap();
        assert_eq!(written, buf.len());

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Response = codec.decode(&mut cursor).await.unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn header_matches_sealed_length() {
        let codec = codec();
        for size in [0usize, 1, 4096] {
            let req = Request::new(CommandKind::Download, "id", "x".repeat(size));
            let frame = codec.encode(&req).unwrap();
            assert_eq!(header_of(&frame), frame.len() - HEADER_SIZE, "size {size}");
        }

        // Empty message: varint(0) only.
        let frame = codec.encode(&Request::default()).unwrap();
        assert_eq!(header_of(&frame), NONCE_SIZE + 1 + TAG_SIZE);
    }

    #[tokio::test]
    async fn tampered_frame_is_rejected() {
        let codec = codec();
        let frame = codec
            .encode(&Request::new(CommandKind::Exit, "Z", "test"))
            .unwrap();

        for byte in HEADER_SIZE..frame.len() {
            for bit in 0..8 {
                let mut tampered = frame.clone();
                tampered[byte] ^= 1 << bit;
                let mut cursor = std::io::Cursor::new(tampered);
                let err = codec.decode::<Request, _>(&mut cursor).await.unwrap_err();
                assert!(
                    matches!(err, ChannelError::AuthenticationFailed),
                    "byte {byte} bit {bit}: {err}"
                );
            }
        }
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let frame = codec()
            .encode(&Request::new(CommandKind::Info, "a", "b"))
            .unwrap();
        let other = FrameCodec::with_key(&SharedKey::new([1u8; KEY_SIZE]));
        let mut cursor = std::io::Cursor::new(frame);
        let err = other.decode::<Request, _>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ChannelError::AuthenticationFailed));
    }

    #[tokio::test]
    async fn one_byte_at_a_time() {
        let codec = codec();
        let req = Request::new(CommandKind::Collect, "slow", "trickle");
        let frame = codec.encode(&req).unwrap();

        let mut builder = tokio_test::io::Builder::new();
        for byte in &frame {
            builder.read(std::slice::from_ref(byte));
        }
        let mut mock = builder.build();

        let decoded: Request = codec.decode(&mut mock).await.unwrap();
        assert_eq!(decoded, req);
    }

    #[tokio::test]
    async fn eof_before_header_is_closed() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0]);
        let err = codec().decode::<Request, _>(&mut cursor).await.unwrap_err();
        assert!(err.is_connection_closed());

        let mut empty = std::io::Cursor::new(Vec::new());
        let err = codec().decode::<Request, _>(&mut empty).await.unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn eof_mid_body_is_closed() {
        let codec = codec();
        let mut frame = codec
            .encode(&Request::new(CommandKind::Info, "a", "b"))
            .unwrap();
        frame.truncate(frame.len() - 3);

        let mut cursor = std::io::Cursor::new(frame);
        let err = codec.decode::<Request, _>(&mut cursor).await.unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn large_header_without_body_is_closed() {
        // A header at the size limit followed by a trickle, then EOF.
        let codec = codec();
        let mut mock = tokio_test::io::Builder::new()
            .read(&(DEFAULT_MAX_FRAME_SIZE as u32).to_be_bytes())
            .read(&[0xAB; 16])
            .read(&[0xCD; 16])
            .build();
        let err = codec.read_frame(&mut mock).await.unwrap_err();
        assert!(err.is_connection_closed(), "{err}");
    }

    #[tokio::test]
    async fn body_larger_than_initial_buffer() {
        let codec = codec();
        let frame = codec
            .encode(&Request::new(CommandKind::RunCommand, "r", "x".repeat(64 * 1024)))
            .unwrap();

        let mut builder = tokio_test::io::Builder::new();
        for chunk in frame.chunks(1000) {
            builder.read(chunk);
        }
        let sealed = codec.read_frame(&mut builder.build()).await.unwrap();
        assert_eq!(sealed.len(), frame.len() - HEADER_SIZE);
        assert_eq!(sealed, frame[HEADER_SIZE..]);
    }

    #[tokio::test]
    async fn oversized_header_is_rejected() {
        let codec = codec().with_max_frame_size(64);
        let mut cursor = std::io::Cursor::new(1024u32.to_be_bytes().to_vec());
        let err = codec.decode::<Request, _>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ChannelError::FrameTooLarge { len: 1024, max: 64 }));
    }

    #[tokio::test]
    async fn body_length_mismatch_is_malformed() {
        let key = SharedKey::new([9u8; KEY_SIZE]);
        // Claims five body bytes, carries one.
        let mut cursor = std::io::Cursor::new(raw_frame(&key, &[0x05, 0x08]));
        let err = codec().decode::<Request, _>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ChannelError::FrameMalformed(_)), "{err}");
    }

    #[tokio::test]
    async fn truncated_varint_is_malformed() {
        let key = SharedKey::new([9u8; KEY_SIZE]);
        let mut cursor = std::io::Cursor::new(raw_frame(&key, &[0xFF]));
        let err = codec().decode::<Request, _>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ChannelError::FrameMalformed(_)), "{err}");
    }

    #[tokio::test]
    async fn invalid_body_is_malformed() {
        let key = SharedKey::new([9u8; KEY_SIZE]);
        // Field 2 declared as string with length 10 but only 1 byte follows.
        let mut cursor = std::io::Cursor::new(raw_frame(&key, &[0x03, 0x12, 0x0A, 0x41]));
        let err = codec().decode::<Request, _>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ChannelError::FrameMalformed(_)), "{err}");
    }
}
