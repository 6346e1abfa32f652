use bytes::Bytes;
use std::fmt;
use std::io::{self, Read};

/// In-memory request body that can be replayed from the start.
///
/// Retries and re-signing depend on re-reading exactly the bytes that were
/// hashed, so the buffer is immutable and only the cursor moves.
#[derive(Debug, Clone, Default)]
pub struct RewindableBody {
    data: Bytes,
    position: usize,
}

impl RewindableBody {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Full contents regardless of the cursor.
    pub fn contents(&self) -> Bytes {
        self.data.clone()
    }
}

impl Read for RewindableBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.position..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }
}

/// Body attached to an outbound request.
#[derive(Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// One-shot stream; consumed by signing or by [`RequestBody::into_rewindable`].
    Reader(Box<dyn Read + Send>),
    Rewindable(RewindableBody),
}

impl RequestBody {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        RequestBody::Rewindable(RewindableBody::new(data))
    }

    pub fn is_rewindable(&self) -> bool {
        matches!(self, RequestBody::Rewindable(_))
    }

    /// Drains a one-shot reader into memory so the body can be replayed.
    pub fn into_rewindable(self) -> io::Result<RewindableBody> {
        match self {
            RequestBody::Empty => Ok(RewindableBody::default()),
            RequestBody::Rewindable(mut body) => {
                body.rewind();
                Ok(body)
            }
            RequestBody::Reader(mut reader) => {
                let mut buffer = Vec::new();
                reader.read_to_end(&mut buffer)?;
                Ok(RewindableBody::new(buffer))
            }
        }
    }

    /// Bytes handed to the wire. Rewindable bodies are sent in full.
    pub fn to_bytes(&mut self) -> io::Result<Bytes> {
        match self {
            RequestBody::Empty => Ok(Bytes::new()),
            RequestBody::Rewindable(body) => Ok(body.contents()),
            RequestBody::Reader(reader) => {
                let mut buffer = Vec::new();
                reader.read_to_end(&mut buffer)?;
                Ok(Bytes::from(buffer))
            }
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Reader(_) => f.write_str("Reader(..)"),
            RequestBody::Rewindable(body) => f
                .debug_struct("Rewindable")
                .field("len", &body.len())
                .field("position", &body.position())
                .finish(),
        }
    }
}
