//! Wire protocol layer: message envelope, stream abstraction, framed
//! codecs and the codec registry.
//!
//! A codec is bound to one connection and split into a read half and a
//! write half, so the single reader coroutine and the mutex-guarded
//! writers never share state. Bodies are opaque payload bytes at this
//! layer; typed values enter and leave through [`ContentType`].

use std::collections::HashMap;
use std::error::Error as StdError;
use std::io::{self, Read, Write};
use std::sync::{LazyLock, RwLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

mod binary;
mod json;

pub use binary::new_bincode_codec;
pub use json::new_json_codec;

/// Codec tag of the built-in binary codec.
pub const BINCODE: &str = "application/bincode";
/// Codec tag of the built-in text codec.
pub const JSON: &str = "application/json";

/// The per-message envelope exchanged on the wire.
///
/// Every request frame carries a header followed by the argument body;
/// every reply frame carries a header with the same `seq` followed by the
/// reply body (or a placeholder when `error` is set).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Qualified method name of the form `"Service.Method"`.
    pub service_method: String,
    /// Request identifier, unique within one client connection.
    pub seq: u64,
    /// Empty on success; otherwise the server-side failure text.
    pub error: String,
}

/// A full-duplex byte stream a codec can be bound to.
///
/// `try_clone` yields an independent handle onto the same stream so the
/// read and write halves can live on different coroutines; `shutdown`
/// closes both directions, which unblocks a reader parked on the stream.
pub trait Transport: Read + Write + Send + 'static {
    /// Clone an independent handle onto the same underlying stream.
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;
    /// Shut the stream down in both directions.
    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for may::net::TcpStream {
    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new((*self).try_clone()?))
    }

    fn shutdown(&self) -> io::Result<()> {
        (*self).shutdown(std::net::Shutdown::Both)
    }
}

#[cfg(unix)]
impl Transport for may::os::unix::net::UnixStream {
    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new((*self).try_clone()?))
    }

    fn shutdown(&self) -> io::Result<()> {
        (*self).shutdown(std::net::Shutdown::Both)
    }
}

/// Read half of a stream-bound codec.
///
/// A header frame immediately precedes its body frame; callers must
/// consume them as a pair or the stream desynchronizes. Dropping the
/// bytes returned by [`read_body`](Self::read_body) is how a reply with
/// no pending call is discarded without losing framing.
pub trait CodecRead: Send {
    /// Decode the next header frame.
    fn read_header(&mut self) -> io::Result<Header>;
    /// Decode the next body frame as an opaque payload.
    fn read_body(&mut self) -> io::Result<Bytes>;
}

/// Write half of a stream-bound codec.
pub trait CodecWrite: Send {
    /// Encode a header frame followed by its body frame and flush.
    ///
    /// Serialization against concurrent writers is the caller's job (the
    /// sending mutex on either peer). If any encode or write step fails
    /// the codec shuts the underlying stream down before returning, so
    /// the peer observes disconnection rather than a torn frame.
    fn write(&mut self, header: &Header, body: &[u8]) -> io::Result<()>;
    /// Close the underlying stream.
    fn close(&mut self) -> io::Result<()>;
}

/// Boxed read/write halves produced by a codec factory.
pub type CodecPair = (Box<dyn CodecRead>, Box<dyn CodecWrite>);

/// Factory signature: bind a codec to a stream and split it.
pub type NewCodecFn = fn(Box<dyn Transport>) -> io::Result<CodecPair>;

/// How typed values become body payloads and back.
///
/// This is the value-level half of a codec tag: the framing lives behind
/// [`CodecRead`]/[`CodecWrite`], the content encoding lives here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Compact binary encoding, for peers in the same ecosystem.
    Bincode,
    /// Plain JSON text.
    Json,
}

impl ContentType {
    /// Resolve a built-in content type from its codec tag.
    pub fn from_tag(tag: &str) -> Option<ContentType> {
        match tag {
            BINCODE => Some(ContentType::Bincode),
            JSON => Some(ContentType::Json),
            _ => None,
        }
    }

    /// The codec tag this content type is registered under.
    pub fn tag(&self) -> &'static str {
        match self {
            ContentType::Bincode => BINCODE,
            ContentType::Json => JSON,
        }
    }

    /// Encode a value into body payload bytes.
    pub fn encode<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, Box<dyn StdError + Send + Sync>> {
        match self {
            ContentType::Bincode => bincode::serialize(value).map_err(Into::into),
            ContentType::Json => serde_json::to_vec(value).map_err(Into::into),
        }
    }

    /// Decode a value out of body payload bytes.
    pub fn decode<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
    ) -> Result<T, Box<dyn StdError + Send + Sync>> {
        match self {
            ContentType::Bincode => bincode::deserialize(bytes).map_err(Into::into),
            ContentType::Json => serde_json::from_slice(bytes).map_err(Into::into),
        }
    }
}

/// A registry entry: the framing factory plus the content encoding its
/// bodies use.
#[derive(Clone, Copy)]
pub struct CodecFactory {
    /// Value-level encoding of the bodies this codec frames.
    pub content: ContentType,
    /// Open a codec pair over a stream.
    pub open: NewCodecFn,
}

static CODECS: LazyLock<RwLock<HashMap<String, CodecFactory>>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    map.insert(
        BINCODE.to_owned(),
        CodecFactory {
            content: ContentType::Bincode,
            open: new_bincode_codec,
        },
    );
    map.insert(
        JSON.to_owned(),
        CodecFactory {
            content: ContentType::Json,
            open: new_json_codec,
        },
    );
    RwLock::new(map)
});

/// Register a codec factory under a tag, replacing any previous entry.
///
/// The built-in tags are seeded on first use; additional framings can be
/// plugged in at startup, each reusing one of the built-in content types.
pub fn register_codec(tag: &str, factory: CodecFactory) {
    CODECS.write().unwrap().insert(tag.to_owned(), factory);
}

/// Look a codec factory up by tag.
pub fn codec_factory(tag: &str) -> Option<CodecFactory> {
    CODECS.read().unwrap().get(tag).copied()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Transport;
    use std::io::{self, Cursor, Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Write-only capture stream; reads are refused.
    #[derive(Clone, Default)]
    pub struct Sink {
        buf: Arc<Mutex<Vec<u8>>>,
        closed: Arc<AtomicBool>,
    }

    impl Sink {
        pub fn new() -> Self {
            Sink::default()
        }

        pub fn bytes(&self) -> Vec<u8> {
            self.buf.lock().unwrap().clone()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Read for Sink {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "sink is write-only"))
        }
    }

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buf.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for Sink {
        fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
            Ok(Box::new(self.clone()))
        }

        fn shutdown(&self) -> io::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Read-only replay stream over captured bytes; writes are refused.
    pub struct Source(pub Cursor<Vec<u8>>);

    impl Source {
        pub fn new(bytes: Vec<u8>) -> Self {
            Source(Cursor::new(bytes))
        }
    }

    impl Read for Source {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl Write for Source {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "source is read-only"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for Source {
        fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "source cannot be cloned"))
        }

        fn shutdown(&self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Stream whose writes always fail, for close-on-error coverage.
    #[derive(Clone, Default)]
    pub struct BrokenPipe {
        closed: Arc<AtomicBool>,
    }

    impl BrokenPipe {
        pub fn new() -> Self {
            BrokenPipe::default()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Read for BrokenPipe {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
        }
    }

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
        }
    }

    impl Transport for BrokenPipe {
        fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
            Ok(Box::new(self.clone()))
        }

        fn shutdown(&self) -> io::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tags_resolve() {
        let bin = codec_factory(BINCODE).unwrap();
        assert_eq!(bin.content, ContentType::Bincode);
        let json = codec_factory(JSON).unwrap();
        assert_eq!(json.content, ContentType::Json);
        assert!(codec_factory("application/xml").is_none());
    }

    #[test]
    fn extra_tag_can_be_registered() {
        register_codec(
            "application/bincode-framed2",
            CodecFactory {
                content: ContentType::Bincode,
                open: new_bincode_codec,
            },
        );
        let got = codec_factory("application/bincode-framed2").unwrap();
        assert_eq!(got.content, ContentType::Bincode);
    }

    #[test]
    fn content_round_trip() {
        for ct in [ContentType::Bincode, ContentType::Json] {
            let bytes = ct.encode(&(7u32, "seven".to_owned())).unwrap();
            let (n, s): (u32, String) = ct.decode(&bytes).unwrap();
            assert_eq!((n, s.as_str()), (7, "seven"));
            assert_eq!(ContentType::from_tag(ct.tag()), Some(ct));
        }
    }
}
