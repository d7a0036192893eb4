//! Replayable request bodies
//!
//! A [`ReplayableBody`] wraps the bytes of one request so that a failed
//! attempt can be retried without asking the caller for the data again.
//! The executor calls [`ReplayableBody::checkpoint`] before the first attempt
//! and [`ReplayableBody::reset`] before every retry.
//!
//! How far a body can rewind depends on where its bytes come from:
//!
//! | Source          | Rewind                                              |
//! |-----------------|-----------------------------------------------------|
//! | `from_bytes`    | always                                              |
//! | `from_seekable` | always (seeks the source)                           |
//! | `from_reader`   | while no more than `reset_limit` bytes were read    |
//! | `unbuffered`    | only if nothing was read since the checkpoint       |
//!
//! A buffered body whose reader runs more than `reset_limit` bytes past the
//! checkpoint drops its replay buffer; a later `reset` fails with
//! [`BodyError::UnrecoverableStreamState`] instead of resending partial data.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Failures raised while reading or rewinding a body
#[derive(Error, Debug, Clone)]
pub enum BodyError {
    #[error("Unrecoverable stream state: {0}")]
    UnrecoverableStreamState(String),

    #[error("Checksum mismatch ({algorithm}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("Body I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for BodyError {
    fn from(err: io::Error) -> Self {
        BodyError::Io(err.to_string())
    }
}

/// Caller-declared digest of the full body, hex encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentChecksum {
    Md5(String),
    Sha256(String),
}

impl ContentChecksum {
    fn algorithm(&self) -> &'static str {
        match self {
            ContentChecksum::Md5(_) => "md5",
            ContentChecksum::Sha256(_) => "sha256",
        }
    }

    fn expected(&self) -> &str {
        match self {
            ContentChecksum::Md5(hex) | ContentChecksum::Sha256(hex) => hex,
        }
    }
}

/// Payload hash placed in the signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadHash {
    /// Hex SHA-256 of the remaining body
    Sha256(String),
    /// Body could not be hashed without losing the ability to rewind
    Unsigned,
}

impl PayloadHash {
    pub const UNSIGNED_PAYLOAD: &'static str = "UNSIGNED-PAYLOAD";

    /// Hash of an empty payload
    pub fn empty() -> Self {
        PayloadHash::Sha256(sha256_hex(b""))
    }

    /// Value for the `x-amz-content-sha256` header
    pub fn header_value(&self) -> &str {
        match self {
            PayloadHash::Sha256(hex) => hex,
            PayloadHash::Unsigned => Self::UNSIGNED_PAYLOAD,
        }
    }
}

/// Hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex MD5 of `data`
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Base64 MD5 of `data`, as carried by `Content-MD5`
pub fn md5_base64(data: &[u8]) -> String {
    BASE64.encode(Md5::digest(data))
}

/// Base64 SHA-256 of `data`, as carried by `x-amz-checksum-sha256`
pub fn sha256_base64(data: &[u8]) -> String {
    BASE64.encode(Sha256::digest(data))
}

trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

enum Source {
    Bytes(Bytes),
    Seekable {
        inner: Box<dyn ReadSeek>,
        origin: u64,
    },
    Buffered {
        reader: Box<dyn Read + Send>,
        limit: usize,
        /// Holds `[buffer_start, buffer_start + buffer.len())`
        buffer: Vec<u8>,
        buffer_start: u64,
        resettable: bool,
        eof: bool,
    },
    Unbuffered {
        reader: Box<dyn Read + Send>,
    },
}

impl Source {
    fn kind(&self) -> &'static str {
        match self {
            Source::Bytes(_) => "bytes",
            Source::Seekable { .. } => "seekable",
            Source::Buffered { .. } => "buffered",
            Source::Unbuffered { .. } => "unbuffered",
        }
    }
}

#[derive(Clone)]
enum RunningDigest {
    Md5(Md5),
    Sha256(Sha256),
}

impl RunningDigest {
    fn for_checksum(checksum: &ContentChecksum) -> Self {
        match checksum {
            ContentChecksum::Md5(_) => RunningDigest::Md5(Md5::new()),
            ContentChecksum::Sha256(_) => RunningDigest::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            RunningDigest::Md5(hasher) => hasher.update(data),
            RunningDigest::Sha256(hasher) => hasher.update(data),
        }
    }

    fn hex(&self) -> String {
        match self.clone() {
            RunningDigest::Md5(hasher) => hex::encode(hasher.finalize()),
            RunningDigest::Sha256(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Request body that can be rewound to a checkpoint
pub struct ReplayableBody {
    source: Source,
    position: u64,
    checkpoint: u64,
    content_length: Option<u64>,
    expected: Option<ContentChecksum>,
    digest: Option<RunningDigest>,
    /// Bytes at or beyond this offset have not been fed to `digest` yet
    hashed_up_to: u64,
    verified: bool,
}

impl fmt::Debug for ReplayableBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayableBody")
            .field("source", &self.source.kind())
            .field("position", &self.position)
            .field("checkpoint", &self.checkpoint)
            .field("content_length", &self.content_length)
            .field("expected", &self.expected)
            .finish()
    }
}

impl ReplayableBody {
    fn new(source: Source, content_length: Option<u64>) -> Self {
        Self {
            source,
            position: 0,
            checkpoint: 0,
            content_length,
            expected: None,
            digest: None,
            hashed_up_to: 0,
            verified: false,
        }
    }

    /// In-memory body; always rewindable
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let len = data.len() as u64;
        Self::new(Source::Bytes(data), Some(len))
    }

    /// Empty body
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    /// Body over a seekable source, starting at its current position
    pub fn from_seekable<S>(mut source: S) -> Result<Self, BodyError>
    where
        S: Read + Seek + Send + 'static,
    {
        let origin = source.stream_position()?;
        let end = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(origin))?;
        Ok(Self::new(
            Source::Seekable {
                inner: Box::new(source),
                origin,
            },
            Some(end.saturating_sub(origin)),
        ))
    }

    /// Body over a local file
    pub fn from_file(path: &Path) -> Result<Self, BodyError> {
        let file = std::fs::File::open(path)?;
        Self::from_seekable(file)
    }

    /// Body over a forward-only reader, replayable for up to `reset_limit`
    /// bytes past the checkpoint
    pub fn from_reader<R>(reader: R, reset_limit: usize) -> Self
    where
        R: Read + Send + 'static,
    {
        Self::new(
            Source::Buffered {
                reader: Box::new(reader),
                limit: reset_limit,
                buffer: Vec::new(),
                buffer_start: 0,
                resettable: true,
                eof: false,
            },
            None,
        )
    }

    /// Body over a forward-only reader with no replay buffer
    pub fn unbuffered<R>(reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        Self::new(
            Source::Unbuffered {
                reader: Box::new(reader),
            },
            None,
        )
    }

    /// Declare the total length of a reader-backed body
    pub fn with_content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }

    /// Declare the digest of the full body; verified when the end of the
    /// stream is reached. Must be set before any byte is read.
    pub fn with_expected_checksum(mut self, checksum: ContentChecksum) -> Self {
        self.digest = Some(RunningDigest::for_checksum(&checksum));
        self.expected = Some(checksum);
        self.hashed_up_to = 0;
        self.verified = false;
        self
    }

    /// Total length, when known
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Bytes delivered so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Position `reset` returns to
    pub fn checkpoint_position(&self) -> u64 {
        self.checkpoint
    }

    /// Bytes read past the checkpoint; counts against the reset limit
    pub fn bytes_since_checkpoint(&self) -> u64 {
        self.position - self.checkpoint
    }

    /// Whether `reset` would succeed right now
    pub fn can_reset(&self) -> bool {
        match &self.source {
            Source::Bytes(_) | Source::Seekable { .. } => true,
            Source::Buffered { resettable, .. } => *resettable,
            Source::Unbuffered { .. } => self.position == self.checkpoint,
        }
    }

    /// Record the current position as the rewind target
    pub fn checkpoint(&mut self) {
        let position = self.position;
        self.checkpoint = position;
        if let Source::Buffered {
            buffer,
            buffer_start,
            resettable,
            ..
        } = &mut self.source
        {
            release_before(buffer, buffer_start, position);
            *resettable = true;
        }
    }

    /// Rewind to the last checkpoint
    pub fn reset(&mut self) -> Result<(), BodyError> {
        match &mut self.source {
            Source::Bytes(_) => {}
            Source::Seekable { inner, origin } => {
                inner.seek(SeekFrom::Start(*origin + self.checkpoint))?;
            }
            Source::Buffered {
                resettable, limit, ..
            } => {
                if !*resettable {
                    return Err(BodyError::UnrecoverableStreamState(format!(
                        "{} bytes read since the checkpoint exceed the reset limit of {} bytes",
                        self.position - self.checkpoint,
                        limit
                    )));
                }
            }
            Source::Unbuffered { .. } => {
                if self.position != self.checkpoint {
                    return Err(BodyError::UnrecoverableStreamState(format!(
                        "source cannot seek and {} bytes were read without buffering",
                        self.position - self.checkpoint
                    )));
                }
            }
        }
        self.position = self.checkpoint;
        Ok(())
    }

    /// Read up to `out.len()` bytes; `Ok(0)` at end of stream
    pub fn read_chunk(&mut self, out: &mut [u8]) -> Result<usize, BodyError> {
        if out.is_empty() {
            return Ok(0);
        }

        let start = self.position;
        let n = match &mut self.source {
            Source::Bytes(data) => {
                let offset = (start as usize).min(data.len());
                let n = (data.len() - offset).min(out.len());
                out[..n].copy_from_slice(&data[offset..offset + n]);
                n
            }
            Source::Seekable { inner, .. } => inner.read(out)?,
            Source::Buffered {
                reader,
                buffer,
                buffer_start,
                resettable,
                eof,
                ..
            } => {
                let buffer_end = *buffer_start + buffer.len() as u64;
                if start < buffer_end {
                    let offset = (start - *buffer_start) as usize;
                    let n = (buffer.len() - offset).min(out.len());
                    out[..n].copy_from_slice(&buffer[offset..offset + n]);
                    n
                } else if *eof {
                    0
                } else {
                    let n = reader.read(out)?;
                    if n == 0 {
                        *eof = true;
                    } else if *resettable {
                        buffer.extend_from_slice(&out[..n]);
                    }
                    n
                }
            }
            Source::Unbuffered { reader } => reader.read(out)?,
        };

        self.position += n as u64;
        self.enforce_reset_limit();

        if n == 0 {
            self.verify_checksum()?;
        } else {
            self.feed_digest(start, &out[..n]);
        }
        Ok(n)
    }

    /// Read everything from the current position to the end
    pub fn read_remaining(&mut self) -> Result<Vec<u8>, BodyError> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = self.read_chunk(&mut chunk)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// SHA-256 of the bytes from the current position to the end, leaving
    /// the position unchanged
    ///
    /// A buffered body is hashed only if the rest of it fits within the reset
    /// limit; otherwise, and for unbuffered bodies, the payload is reported
    /// as [`PayloadHash::Unsigned`].
    pub fn payload_hash(&mut self) -> Result<PayloadHash, BodyError> {
        let position = self.position;
        let checkpoint = self.checkpoint;
        match &mut self.source {
            Source::Bytes(data) => {
                let offset = (position as usize).min(data.len());
                Ok(PayloadHash::Sha256(sha256_hex(&data[offset..])))
            }
            Source::Seekable { inner, origin } => {
                let mut hasher = Sha256::new();
                let mut chunk = [0u8; 8192];
                loop {
                    let n = inner.read(&mut chunk)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&chunk[..n]);
                }
                inner.seek(SeekFrom::Start(*origin + position))?;
                Ok(PayloadHash::Sha256(hex::encode(hasher.finalize())))
            }
            Source::Buffered {
                reader,
                limit,
                buffer,
                buffer_start,
                resettable,
                eof,
            } => {
                if !*resettable {
                    return Ok(PayloadHash::Unsigned);
                }
                let mut chunk = [0u8; 8192];
                while !*eof {
                    let held = (*buffer_start + buffer.len() as u64 - checkpoint) as usize;
                    if held > *limit {
                        return Ok(PayloadHash::Unsigned);
                    }
                    let want = (*limit + 1 - held).min(chunk.len());
                    let n = reader.read(&mut chunk[..want])?;
                    if n == 0 {
                        *eof = true;
                    } else {
                        buffer.extend_from_slice(&chunk[..n]);
                    }
                }
                let offset = (position - *buffer_start) as usize;
                Ok(PayloadHash::Sha256(sha256_hex(&buffer[offset..])))
            }
            Source::Unbuffered { .. } => Ok(PayloadHash::Unsigned),
        }
    }

    fn enforce_reset_limit(&mut self) {
        let position = self.position;
        let since_checkpoint = position - self.checkpoint;
        if let Source::Buffered {
            limit,
            buffer,
            buffer_start,
            resettable,
            ..
        } = &mut self.source
        {
            if *resettable && since_checkpoint > *limit as u64 {
                debug!(
                    since_checkpoint,
                    reset_limit = *limit,
                    "Replay buffer evicted; body can no longer be reset"
                );
                *resettable = false;
            }
            if !*resettable {
                release_before(buffer, buffer_start, position);
            }
        }
    }

    fn feed_digest(&mut self, start: u64, data: &[u8]) {
        let Some(digest) = self.digest.as_mut() else {
            return;
        };
        let end = start + data.len() as u64;
        if end > self.hashed_up_to {
            let skip = self.hashed_up_to.saturating_sub(start) as usize;
            digest.update(&data[skip..]);
            self.hashed_up_to = end;
        }
    }

    fn verify_checksum(&mut self) -> Result<(), BodyError> {
        if self.verified {
            return Ok(());
        }
        let (Some(expected), Some(digest)) = (&self.expected, &self.digest) else {
            return Ok(());
        };
        let actual = digest.hex();
        if !actual.eq_ignore_ascii_case(expected.expected()) {
            return Err(BodyError::ChecksumMismatch {
                algorithm: expected.algorithm().to_string(),
                expected: expected.expected().to_string(),
                actual,
            });
        }
        self.verified = true;
        Ok(())
    }
}

fn release_before(buffer: &mut Vec<u8>, buffer_start: &mut u64, upto: u64) {
    if upto <= *buffer_start {
        return;
    }
    let consumed = ((upto - *buffer_start) as usize).min(buffer.len());
    buffer.drain(..consumed);
    *buffer_start = upto;
}

impl Read for ReplayableBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_chunk(buf).map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn read_exactly(body: &mut ReplayableBody, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = body.read_chunk(&mut out[filled..]).unwrap();
            assert!(read > 0, "unexpected end of stream");
            filled += read;
        }
        out
    }

    #[test]
    fn test_reset_within_limit_replays_same_bytes() {
        let data = sample(64);
        let mut body = ReplayableBody::from_reader(Cursor::new(data.clone()), 16);
        body.checkpoint();

        let first = read_exactly(&mut body, 16);
        assert!(body.can_reset());
        body.reset().unwrap();

        let second = read_exactly(&mut body, 16);
        assert_eq!(first, second);
        assert_eq!(first, data[..16]);
    }

    #[test]
    fn test_reset_past_limit_fails() {
        let mut body = ReplayableBody::from_reader(Cursor::new(sample(64)), 16);
        body.checkpoint();

        read_exactly(&mut body, 17);
        assert!(!body.can_reset());
        assert!(matches!(
            body.reset(),
            Err(BodyError::UnrecoverableStreamState(_))
        ));
    }

    #[test]
    fn test_checkpoint_restores_replay_after_eviction() {
        let data = sample(64);
        let mut body = ReplayableBody::from_reader(Cursor::new(data.clone()), 8);
        read_exactly(&mut body, 20);
        assert!(body.reset().is_err());

        body.checkpoint();
        let chunk = read_exactly(&mut body, 8);
        body.reset().unwrap();
        assert_eq!(read_exactly(&mut body, 8), chunk);
        assert_eq!(chunk, data[20..28]);
    }

    #[test]
    fn test_checkpoint_during_replay_keeps_tail() {
        let data = sample(32);
        let mut body = ReplayableBody::from_reader(Cursor::new(data.clone()), 16);
        body.checkpoint();
        read_exactly(&mut body, 12);
        body.reset().unwrap();

        read_exactly(&mut body, 4);
        body.checkpoint();
        assert_eq!(body.checkpoint_position(), 4);

        let rest = body.read_remaining().unwrap();
        assert_eq!(rest, data[4..]);
    }

    #[test]
    fn test_bytes_body_always_resets() {
        let data = sample(1000);
        let mut body = ReplayableBody::from_bytes(data.clone());
        body.checkpoint();
        assert_eq!(body.read_remaining().unwrap(), data);
        body.reset().unwrap();
        assert_eq!(body.position(), 0);
        assert_eq!(body.read_remaining().unwrap(), data);
        assert_eq!(body.content_length(), Some(1000));
    }

    #[test]
    fn test_seekable_body_resets_by_seeking() {
        let data = sample(300);
        let mut cursor = Cursor::new(data.clone());
        cursor.set_position(100);
        let mut body = ReplayableBody::from_seekable(cursor).unwrap();
        assert_eq!(body.content_length(), Some(200));

        read_exactly(&mut body, 50);
        body.checkpoint();
        let chunk = read_exactly(&mut body, 120);
        body.reset().unwrap();
        assert_eq!(read_exactly(&mut body, 120), chunk);
        assert_eq!(chunk, data[150..270]);
    }

    #[test]
    fn test_unbuffered_body() {
        let mut body = ReplayableBody::unbuffered(Cursor::new(sample(10)));
        body.checkpoint();
        assert!(body.reset().is_ok());

        read_exactly(&mut body, 1);
        assert!(matches!(
            body.reset(),
            Err(BodyError::UnrecoverableStreamState(_))
        ));
    }

    #[test]
    fn test_checksum_verified_at_end_of_stream() {
        let data = b"hello replay".to_vec();
        let mut body = ReplayableBody::from_bytes(data.clone())
            .with_expected_checksum(ContentChecksum::Sha256(sha256_hex(&data)));
        assert_eq!(body.read_remaining().unwrap(), data);

        let mut body = ReplayableBody::from_bytes(data.clone())
            .with_expected_checksum(ContentChecksum::Md5(md5_hex(b"something else")));
        assert!(matches!(
            body.read_remaining(),
            Err(BodyError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_replay_does_not_double_count_digest() {
        let data = sample(40);
        let mut body = ReplayableBody::from_reader(Cursor::new(data.clone()), 64)
            .with_expected_checksum(ContentChecksum::Md5(md5_hex(&data)));
        body.checkpoint();
        read_exactly(&mut body, 25);
        body.reset().unwrap();
        read_exactly(&mut body, 10);
        body.reset().unwrap();

        assert_eq!(body.read_remaining().unwrap(), data);
    }

    #[test]
    fn test_payload_hash_leaves_position() {
        let data = sample(100);
        let expected = sha256_hex(&data);

        let mut body = ReplayableBody::from_reader(Cursor::new(data.clone()), 128);
        body.checkpoint();
        assert_eq!(body.payload_hash().unwrap(), PayloadHash::Sha256(expected.clone()));
        assert_eq!(body.position(), 0);
        assert_eq!(body.read_remaining().unwrap(), data);

        let mut body = ReplayableBody::from_seekable(Cursor::new(data.clone())).unwrap();
        assert_eq!(body.payload_hash().unwrap(), PayloadHash::Sha256(expected));
        assert_eq!(body.read_remaining().unwrap(), data);
    }

    #[test]
    fn test_payload_hash_beyond_limit_is_unsigned() {
        let data = sample(100);
        let mut body = ReplayableBody::from_reader(Cursor::new(data.clone()), 50);
        body.checkpoint();
        assert_eq!(body.payload_hash().unwrap(), PayloadHash::Unsigned);
        assert_eq!(body.payload_hash().unwrap().header_value(), "UNSIGNED-PAYLOAD");

        // lookahead is still delivered in order
        assert_eq!(body.read_remaining().unwrap(), data);

        let mut body = ReplayableBody::unbuffered(Cursor::new(data));
        assert_eq!(body.payload_hash().unwrap(), PayloadHash::Unsigned);
    }

    #[test]
    fn test_io_read_adapter() {
        let mut body = ReplayableBody::from_bytes(&b"abc"[..]);
        let mut out = String::new();
        body.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abc");
    }
}
