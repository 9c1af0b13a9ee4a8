//! Wire framing for duplexwire sessions.
//!
//! Every length on the wire is a varint (seven bits per byte, at most five
//! bytes). Handshake fields travel as length-prefixed records read by
//! [`RecordReader`]; steady-state traffic is a sequence of envelopes handled
//! by [`EnvelopeCodec`], [`EnvelopeReader`] and [`EnvelopeWriter`]. A
//! zero-length envelope ends the session.

pub mod codec;
pub mod error;
pub mod pool;
pub mod reader;
pub mod record;
pub mod varint;
pub mod writer;

pub use codec::{
    decode_envelope, encode_envelope, Envelope, EnvelopeCodec, FrameConfig,
    DEFAULT_MAX_ENVELOPE_SIZE, END_OF_SESSION, KEEP_ALIVE_PAYLOAD,
};
pub use error::{FrameError, Result};
pub use pool::{BufferPool, PooledBuf, DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY};
pub use reader::EnvelopeReader;
pub use record::{decode_record, encode_record, read_record_exact, RecordReader};
pub use varint::{decode_varint, encode_varint, encode_varint_array, MAX_VARINT_LEN, MAX_VARINT_VALUE};
pub use writer::EnvelopeWriter;
