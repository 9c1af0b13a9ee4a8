//! Preamble records: fixed-width bytes and varint-length-prefixed strings.
//!
//! ```text
//! ┌────────────┬──────────────┐
//! │ Length     │ Bytes        │
//! │ (varint)   │ (Length)     │
//! └────────────┴──────────────┘
//! ```

use bytes::{BufMut, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{FrameError, Result};
use crate::pool::PooledBuf;
use crate::varint::{decode_varint, encode_varint};

const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Append a length-prefixed record.
pub fn encode_record(bytes: &[u8], dst: &mut impl BufMut) -> Result<()> {
    encode_varint(bytes.len(), dst)?;
    dst.put_slice(bytes);
    Ok(())
}

/// Decode a length-prefixed record from the front of `src`.
///
/// Returns `Ok(None)` if `src` does not yet hold the whole record, otherwise
/// the record body and the total number of bytes consumed. The length is
/// checked against `max_len` before the body is awaited.
pub fn decode_record(src: &[u8], max_len: usize) -> Result<Option<(&[u8], usize)>> {
    let Some((len, header)) = decode_varint(src)? else {
        return Ok(None);
    };
    let len = len as usize;
    if len > max_len {
        return Err(FrameError::RecordTooLarge {
            size: len,
            max: max_len,
        });
    }
    let total = header + len;
    if src.len() < total {
        return Ok(None);
    }
    Ok(Some((&src[header..total], total)))
}

/// Read one length-prefixed record without reading past its end.
///
/// Used where the bytes after the record belong to someone else (an upgrade
/// exchange, or a stream that is about to be closed).
pub async fn read_record_exact<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> Result<Bytes> {
    let mut header = [0u8; crate::varint::MAX_VARINT_LEN];
    let mut used = 0;
    let len = loop {
        let byte = read_byte(reader).await?;
        header[used] = byte;
        used += 1;
        if let Some((len, _)) = decode_varint(&header[..used])? {
            break len as usize;
        }
    };
    if len > max_len {
        return Err(FrameError::RecordTooLarge {
            size: len,
            max: max_len,
        });
    }
    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(Bytes::from(body)),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(FrameError::ConnectionClosed)
        }
        Err(err) => Err(FrameError::Io(err)),
    }
}

async fn read_byte<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8> {
    match reader.read_u8().await {
        Ok(byte) => Ok(byte),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(FrameError::ConnectionClosed)
        }
        Err(err) => Err(FrameError::Io(err)),
    }
}

/// Reads preamble records from an async stream.
///
/// Reads are chunked into a pooled scratch buffer; bytes read past the last
/// record stay buffered and are handed back by [`RecordReader::into_parts`].
pub struct RecordReader<S> {
    inner: S,
    buf: PooledBuf,
    pos: usize,
}

impl<S: AsyncRead + Unpin> RecordReader<S> {
    /// Wrap `inner`, using `buf` as scratch space.
    pub fn new(inner: S, buf: PooledBuf) -> Self {
        Self { inner, buf, pos: 0 }
    }

    /// Read one fixed byte.
    pub async fn read_u8(&mut self) -> Result<u8> {
        self.fill_to(1).await?;
        let byte = self.buf[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    /// Read `N` fixed bytes.
    pub async fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.fill_to(N).await?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    /// Read one varint.
    pub async fn read_varint(&mut self) -> Result<u32> {
        loop {
            if let Some((value, used)) = decode_varint(self.unread())? {
                self.pos += used;
                return Ok(value);
            }
            self.fill_more().await?;
        }
    }

    /// Read a length-prefixed record of at most `max_len` bytes.
    pub async fn read_record(&mut self, max_len: usize) -> Result<Bytes> {
        loop {
            if let Some((body, used)) = decode_record(self.unread(), max_len)? {
                let body = Bytes::copy_from_slice(body);
                self.pos += used;
                return Ok(body);
            }
            self.fill_more().await?;
        }
    }

    /// Read a length-prefixed UTF-8 record of at most `max_len` bytes.
    pub async fn read_string(&mut self, max_len: usize) -> Result<String> {
        let body = self.read_record(max_len).await?;
        String::from_utf8(body.to_vec()).map_err(|_| FrameError::InvalidUtf8)
    }

    /// Bytes buffered but not yet consumed.
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Mutably borrow the underlying stream (for writing responses).
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Release the scratch buffer and return the stream with any bytes read
    /// ahead of the last record.
    pub fn into_parts(self) -> (S, Bytes) {
        let leftover = Bytes::copy_from_slice(&self.buf[self.pos..]);
        (self.inner, leftover)
    }

    async fn fill_to(&mut self, needed: usize) -> Result<()> {
        while self.unread().len() < needed {
            self.fill_more().await?;
        }
        Ok(())
    }

    async fn fill_more(&mut self) -> Result<()> {
        if self.pos > 0 && self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
        self.buf.reserve(READ_CHUNK_SIZE);
        let read = self.inner.read_buf(&mut *self.buf).await?;
        if read == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        Ok(())
    }
}
