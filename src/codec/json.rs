//! Text codec: JSON values concatenated on the stream.
//!
//! One persistent streaming deserializer per connection tokenizes the
//! successive values, so self-delimiting and lookahead are handled by the
//! tokenizer rather than by any extra framing.

use std::io::{self, BufReader, ErrorKind, Write};

use bytes::Bytes;
use serde::Deserialize;
use serde_json::de::IoRead;
use serde_json::{Deserializer, Value};

use super::{CodecPair, CodecRead, CodecWrite, Header, Transport};

/// Bind the text codec to a stream and split it into halves.
pub fn new_json_codec(stream: Box<dyn Transport>) -> io::Result<CodecPair> {
    let read_half = stream.try_clone()?;
    let reader = JsonReader {
        de: Deserializer::from_reader(BufReader::new(read_half)),
    };
    let writer = JsonWriter {
        stream,
        buf: Vec::with_capacity(256),
    };
    Ok((Box::new(reader), Box::new(writer)))
}

fn decode_err(e: serde_json::Error) -> io::Error {
    if e.is_eof() {
        io::Error::new(ErrorKind::UnexpectedEof, e.to_string())
    } else {
        io::Error::new(ErrorKind::InvalidData, e.to_string())
    }
}

struct JsonReader {
    de: Deserializer<IoRead<BufReader<Box<dyn Transport>>>>,
}

impl CodecRead for JsonReader {
    fn read_header(&mut self) -> io::Result<Header> {
        Header::deserialize(&mut self.de).map_err(decode_err)
    }

    fn read_body(&mut self) -> io::Result<Bytes> {
        let value = Value::deserialize(&mut self.de).map_err(decode_err)?;
        let bytes = serde_json::to_vec(&value)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
        Ok(Bytes::from(bytes))
    }
}

struct JsonWriter {
    stream: Box<dyn Transport>,
    buf: Vec<u8>,
}

impl JsonWriter {
    fn encode(&mut self, header: &Header, body: &[u8]) -> io::Result<()> {
        self.buf.clear();
        serde_json::to_writer(&mut self.buf, header)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
        self.buf.push(b'\n');
        self.buf.extend_from_slice(body);
        self.buf.push(b'\n');

        self.stream.write_all(&self.buf)?;
        self.stream.flush()
    }
}

impl CodecWrite for JsonWriter {
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

#[cfg(test)]
mod tests {
    use super::super::testing::{BrokenPipe, Sink, Source};
    use super::*;

    fn reader_over(bytes: Vec<u8>) -> JsonReader {
        JsonReader {
            de: Deserializer::from_reader(BufReader::new(
                Box::new(Source::new(bytes)) as Box<dyn Transport>
            )),
        }
    }

    fn header(method: &str, seq: u64) -> Header {
        Header {
            service_method: method.to_owned(),
            seq,
            error: String::new(),
        }
    }

    #[test]
    fn successive_values_tokenize() {
        let sink = Sink::new();
        let (_, mut writer) = new_json_codec(Box::new(sink.clone())).unwrap();
        // a bare-number body directly followed by the next header object
        writer.write(&header("Arith.Sum", 1), b"4").unwrap();
        writer
            .write(&header("Echo.Say", 2), br#"{"text":"hi"}"#)
            .unwrap();

        let mut reader = reader_over(sink.bytes());
        assert_eq!(reader.read_header().unwrap(), header("Arith.Sum", 1));
        assert_eq!(&reader.read_body().unwrap()[..], b"4");
        assert_eq!(reader.read_header().unwrap(), header("Echo.Say", 2));
        let body = reader.read_body().unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["text"], "hi");

        assert_eq!(
            reader.read_header().unwrap_err().kind(),
            ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn discarded_body_keeps_the_stream_in_sync() {
        let sink = Sink::new();
        let (_, mut writer) = new_json_codec(Box::new(sink.clone())).unwrap();
        writer
            .write(&header("Arith.Sum", 1), br#"[1,2,3]"#)
            .unwrap();
        writer.write(&header("Arith.Sum", 2), b"null").unwrap();

        let mut reader = reader_over(sink.bytes());
        reader.read_header().unwrap();
        drop(reader.read_body().unwrap());
        assert_eq!(reader.read_header().unwrap(), header("Arith.Sum", 2));
    }

    #[test]
    fn garbage_is_invalid_data() {
        let mut reader = reader_over(b"not json at all".to_vec());
        assert_eq!(
            reader.read_header().unwrap_err().kind(),
            ErrorKind::InvalidData
        );
    }

    #[test]
    fn write_failure_closes_the_stream() {
        let pipe = BrokenPipe::new();
        let (_, mut writer) = new_json_codec(Box::new(pipe.clone())).unwrap();
        assert!(writer.write(&header("Arith.Sum", 1), b"1").is_err());
        assert!(pipe.is_closed());
    }
}
