//! Connection negotiation: the option record both peers agree on before
//! the codec takes over.
//!
//! The record is always JSON so it can be parsed before any codec is
//! known; it is the first thing the client writes on a fresh connection
//! and the first thing the server reads from one.

use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec;

/// Protocol identification constant carried in every handshake.
pub const MAGIC_NUMBER: u64 = 0x3bef5c;

/// Per-connection handshake record.
///
/// Wire field names are part of the protocol:
/// `{"MagicNumber": 3927900, "CodecType": "application/bincode",
/// "ConnectTimeout": <ns>, "HandleTimeout": <ns>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    /// Must be [`MAGIC_NUMBER`]; anything else is refused unless the
    /// server opts into compatibility mode.
    pub magic_number: u64,
    /// Codec tag naming the encoding of all following frames.
    pub codec_type: String,
    /// Upper bound on dial + handshake + codec setup, client-enforced.
    /// Zero means unbounded.
    #[serde(with = "nanos")]
    pub connect_timeout: Duration,
    /// Server-side per-call deadline. Zero means unbounded.
    #[serde(with = "nanos")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            magic_number: MAGIC_NUMBER,
            codec_type: codec::BINCODE.to_owned(),
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    /// The default options with the text codec selected instead.
    pub fn json() -> Self {
        Options {
            codec_type: codec::JSON.to_owned(),
            ..Options::default()
        }
    }
}

/// Durations travel as integer nanoseconds.
mod nanos {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let n = u64::deserialize(d)?;
        Ok(Duration::from_nanos(n))
    }
}

/// Write the handshake record onto a fresh connection.
///
/// No trailing byte is emitted: codec frames follow immediately.
pub(crate) fn write_options<W: Write>(stream: &mut W, opt: &Options) -> io::Result<()> {
    let buf =
        serde_json::to_vec(opt).map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
    stream.write_all(&buf)?;
    stream.flush()
}

/// Read exactly one handshake record off the head of a connection.
///
/// The streaming decoder consumes nothing past the closing brace, so the
/// codec frames behind it stay untouched.
pub(crate) fn read_options<R: Read>(stream: &mut R) -> io::Result<Options> {
    let mut de = serde_json::Deserializer::from_reader(stream);
    Options::deserialize(&mut de)
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))
}
