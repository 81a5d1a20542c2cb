//! Binary codec: bincode-encoded headers and opaque bodies, each framed
//! with a big-endian `u64` length prefix.

use std::io::{self, BufReader, ErrorKind, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Bytes, BytesMut};

use super::{CodecPair, CodecRead, CodecWrite, Header, Transport};

// frame layout: len(u64 BE) + payload([u8; len])
// a header frame is a bincode-encoded Header; its body frame is opaque
const FRAME_MAX_LEN: u64 = 1024 * 1024;

/// Bind the binary codec to a stream and split it into halves.
pub fn new_bincode_codec(stream: Box<dyn Transport>) -> io::Result<CodecPair> {
    let read_half = stream.try_clone()?;
    let reader = BincodeReader {
        reader: BufReader::new(read_half),
        buf: BytesMut::with_capacity(1024 * 32),
    };
    let writer = BincodeWriter {
        stream,
        buf: Vec::with_capacity(1024),
    };
    Ok((Box::new(reader), Box::new(writer)))
}

struct BincodeReader {
    reader: BufReader<Box<dyn Transport>>,
    buf: BytesMut,
}

impl BincodeReader {
    fn read_frame(&mut self) -> io::Result<Bytes> {
        let len = self.reader.read_u64::<BigEndian>()?;
        if len > FRAME_MAX_LEN {
            let s = format!("decode too big frame length. len={len}");
            return Err(io::Error::new(ErrorKind::InvalidInput, s));
        }

        let len = len as usize;
        self.buf.clear();
        self.buf.resize(len, 0);
        self.reader.read_exact(&mut self.buf[..len])?;
        Ok(self.buf.split_to(len).freeze())
    }
}

impl CodecRead for BincodeReader {
    fn read_header(&mut self) -> io::Result<Header> {
        let frame = self.read_frame()?;
        bincode::deserialize(&frame).map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))
    }

    fn read_body(&mut self) -> io::Result<Bytes> {
        self.read_frame()
    }
}

struct BincodeWriter {
    stream: Box<dyn Transport>,
    buf: Vec<u8>,
}

impl BincodeWriter {
    fn encode(&mut self, header: &Header, body: &[u8]) -> io::Result<()> {
        if body.len() as u64 > FRAME_MAX_LEN {
            let s = format!("encode too big frame length. len={}", body.len());
            return Err(io::Error::new(ErrorKind::InvalidInput, s));
        }

        let hdr =
            bincode::serialize(header).map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
        // the peer applies the same cap to header frames on read
        if hdr.len() as u64 > FRAME_MAX_LEN {
            let s = format!("encode too big frame length. len={}", hdr.len());
            return Err(io::Error::new(ErrorKind::InvalidInput, s));
        }

        self.buf.clear();
        self.buf.write_u64::<BigEndian>(hdr.len() as u64)?;
        self.buf.extend_from_slice(&hdr);
        self.buf.write_u64::<BigEndian>(body.len() as u64)?;
        self.buf.extend_from_slice(body);

        self.stream.write_all(&self.buf)?;
        self.stream.flush()
    }
}

impl CodecWrite for BincodeWriter {
    fn write(&mut self, header: &Header, body: &[u8]) -> io::Result<()> {
        let ret = self.encode(header, body);
        if ret.is_err() {
            // never leave the peer a torn frame to parse
            self.stream.shutdown().ok();
        }
        ret
    }

    fn close(&mut self) -> io::Result<()> {
        self.stream.flush().ok();
        self.stream.shutdown()
    }
}
