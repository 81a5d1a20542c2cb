//! Client side: dialing, the pending-call multiplexer and the reader
//! coroutine.
//!
//! Many callers share one connection. A caller registers its call under
//! a fresh sequence number and writes the request through the sending
//! mutex; the single reader coroutine matches each reply header back to
//! its pending call by sequence number, in whatever order the server
//! finishes.

use std::collections::HashMap;
use std::io;
use std::net::ToSocketAddrs;
#[cfg(unix)]
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{error, info};
use may::net::TcpStream;
#[cfg(unix)]
use may::os::unix::net::UnixStream;
use may::sync::mpsc::{self, Sender};
use may::sync::Mutex;
use may::{coroutine, go};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{self, CodecRead, CodecWrite, ContentType, Header, Transport};
use crate::errors::Error;
use crate::options::{self, Options};

/// Sender half of a completion channel.
///
/// The channel is unbounded, so delivering a completion never blocks;
/// one sender may fan in completions from many calls.
pub type Done = Sender<Call>;

/// A completed rpc invocation, delivered on its done channel.
#[derive(Debug)]
pub struct Call {
    seq: u64,
    service_method: String,
    content: ContentType,
    result: Result<Bytes, Error>,
}

impl Call {
    /// The sequence number the call was registered under; zero when the
    /// call was rejected before a number was assigned.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The `"Service.Method"` name the call was made against.
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// The failure, if the call did not produce a reply.
    pub fn error(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }

    /// Decode the typed reply out of the completed call.
    pub fn into_reply<P: DeserializeOwned>(self) -> Result<P, Error> {
        let Call {
            content, result, ..
        } = self;
        let payload = result?;
        content
            .decode(&payload)
            .map_err(|e| Error::ClientDeserialize(e.to_string()))
    }
}

struct PendingCall {
    service_method: String,
    done: Done,
}

impl PendingCall {
    fn complete(self, seq: u64, content: ContentType, result: Result<Bytes, Error>) {
        // at most one completion per call; a gone receiver means the
        // caller already gave up
        let _ = self.done.send(Call {
            seq,
            service_method: self.service_method,
            content,
            result,
        });
    }
}

struct Inner {
    seq: u64,
    pending: HashMap<u64, PendingCall>,
    closing: bool,
    shutdown: bool,
}

struct Shared {
    content: ContentType,
    // the sending mutex owns the write half, so writers cannot bypass it
    sending: Mutex<Box<dyn CodecWrite>>,
    mu: Mutex<Inner>,
}

impl Shared {
    fn register_call(&self, service_method: &str, done: &Done) -> Result<u64, Error> {
        let mut inner = self.mu.lock().unwrap();
        if inner.closing || inner.shutdown {
            return Err(Error::Shutdown);
        }
        let seq = inner.seq;
        inner.seq += 1;
        inner.pending.insert(
            seq,
            PendingCall {
                service_method: service_method.to_owned(),
                done: done.clone(),
            },
        );
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<PendingCall> {
        self.mu.lock().unwrap().pending.remove(&seq)
    }

    fn send(&self, service_method: &str, body: &[u8], done: &Done) -> u64 {
        let mut writer = self.sending.lock().unwrap();

        let seq = match self.register_call(service_method, done) {
            Ok(seq) => seq,
            Err(err) => {
                let _ = done.send(Call {
                    seq: 0,
                    service_method: service_method.to_owned(),
                    content: self.content,
                    result: Err(err),
                });
                return 0;
            }
        };

        let header = Header {
            service_method: service_method.to_owned(),
            seq,
            error: String::new(),
        };
        if let Err(e) = writer.write(&header, body) {
            // the call may already be gone; complete it at most once
            if let Some(call) = self.remove_call(seq) {
                call.complete(seq, self.content, Err(Error::Io(e)));
            }
        }
        seq
    }

    fn terminate_calls(&self, err: &io::Error) {
        let _writer = self.sending.lock().unwrap();
        let mut inner = self.mu.lock().unwrap();
        inner.shutdown = true;
        for (seq, call) in inner.pending.drain() {
            let err = Error::Io(io::Error::new(err.kind(), err.to_string()));
            call.complete(seq, self.content, Err(err));
        }
    }
}

fn receive(shared: Arc<Shared>, mut reader: Box<dyn CodecRead>) {
    let err = loop {
        let header = match reader.read_header() {
            Ok(header) => header,
            Err(e) => break e,
        };

        match shared.remove_call(header.seq) {
            // the matching send already removed the call; drain the body
            // to stay framed
            None => {
                if let Err(e) = reader.read_body() {
                    break e;
                }
            }
            Some(call) if !header.error.is_empty() => {
                let drained = reader.read_body();
                call.complete(header.seq, shared.content, Err(Error::Status(header.error)));
                if let Err(e) = drained {
                    break e;
                }
            }
            Some(call) => match reader.read_body() {
                Ok(body) => call.complete(header.seq, shared.content, Ok(body)),
                Err(e) => {
                    let failed = Error::ClientDeserialize(format!("reading body {e}"));
                    call.complete(header.seq, shared.content, Err(failed));
                    break e;
                }
            },
        }
    };

    if err.kind() == io::ErrorKind::UnexpectedEof {
        info!("rpc client: connection closed");
    } else {
        error!("rpc client: read error: {err}");
    }
    shared.terminate_calls(&err);
}

/// An rpc client bound to one connection.
///
/// Cheap to share behind an `Arc`: all call entry points take `&self`.
pub struct Client {
    shared: Arc<Shared>,
    // an extra handle onto the socket, reserved for shutting it down
    sock: Mutex<Box<dyn Transport>>,
    receiver: Option<coroutine::JoinHandle<()>>,
    timeout: Option<Duration>,
}

impl Client {
    /// Hand an established tcp connection to a new client.
    pub fn new(stream: TcpStream, opt: &Options) -> Result<Client, Error> {
        stream.set_nodelay(true)?;
        Client::with_transport(Box::new(stream), opt)
    }

    /// Build a client over any transport: pick the codec by tag, write
    /// the handshake record, split the stream and spawn the reader.
    pub fn with_transport(mut stream: Box<dyn Transport>, opt: &Options) -> Result<Client, Error> {
        let factory = match codec::codec_factory(&opt.codec_type) {
            Some(factory) => factory,
            None => {
                let err = Error::InvalidCodec(opt.codec_type.clone());
                error!("rpc client: codec error: {err}");
                return Err(err);
            }
        };

        if let Err(e) = options::write_options(&mut stream, opt) {
            error!("rpc client: options error: {e}");
            return Err(Error::Io(e));
        }

        let sock = stream.try_clone()?;
        let (reader, writer) = (factory.open)(stream)?;

        let shared = Arc::new(Shared {
            content: factory.content,
            sending: Mutex::new(writer),
            mu: Mutex::new(Inner {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });

        let receiver = {
            let shared = shared.clone();
            go!(
                coroutine::Builder::new().name("RpcClientReceiver".to_owned()),
                move || receive(shared, reader)
            )?
        };

        Ok(Client {
            shared,
            sock: Mutex::new(sock),
            receiver: Some(receiver),
            timeout: None,
        })
    }

    /// Dial a tcp address with the default options.
    pub fn connect<L: ToSocketAddrs + Send + 'static>(addr: L) -> Result<Client, Error> {
        Client::connect_with(addr, Options::default())
    }

    /// Dial a tcp address, bounding dial + handshake + codec setup by
    /// the options' connect timeout.
    pub fn connect_with<L: ToSocketAddrs + Send + 'static>(
        addr: L,
        opt: Options,
    ) -> Result<Client, Error> {
        dial_timeout(
            move |opt| {
                let stream = TcpStream::connect(addr)?;
                Client::new(stream, opt)
            },
            opt,
        )
    }

    /// Dial a unix domain socket with the default options.
    #[cfg(unix)]
    pub fn connect_uds<P: AsRef<Path> + Send + 'static>(path: P) -> Result<Client, Error> {
        Client::connect_uds_with(path, Options::default())
    }

    /// Dial a unix domain socket under the options' connect timeout.
    #[cfg(unix)]
    pub fn connect_uds_with<P: AsRef<Path> + Send + 'static>(
        path: P,
        opt: Options,
    ) -> Result<Client, Error> {
        dial_timeout(
            move |opt| {
                let stream = UnixStream::connect(path)?;
                Client::with_transport(Box::new(stream), opt)
            },
            opt,
        )
    }

    /// Deadline applied by [`call`](Self::call); the initial state is no
    /// deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// Submit a call asynchronously; its completion arrives on `done`.
    ///
    /// Returns the assigned sequence number, or zero when the call was
    /// rejected before registration (the rejection still arrives on
    /// `done`).
    pub fn go<A: Serialize>(&self, service_method: &str, args: &A, done: &Done) -> u64 {
        let body = match self.shared.content.encode(args) {
            Ok(body) => body,
            Err(e) => {
                let _ = done.send(Call {
                    seq: 0,
                    service_method: service_method.to_owned(),
                    content: self.shared.content,
                    result: Err(Error::ClientSerialize(e.to_string())),
                });
                return 0;
            }
        };
        self.shared.send(service_method, &body, done)
    }

    /// Call synchronously and decode the reply.
    ///
    /// With a deadline set, expiry removes the call from the pending map
    /// and fails with "call failed"; the late reply is discarded by the
    /// reader and the reply value must be considered lost.
    pub fn call<A: Serialize, P: DeserializeOwned>(
        &self,
        service_method: &str,
        args: &A,
    ) -> Result<P, Error> {
        let (tx, rx) = mpsc::channel();
        let seq = self.go(service_method, args, &tx);

        let call = match self.timeout {
            None => match rx.recv() {
                Ok(call) => call,
                Err(_) => return Err(Error::Shutdown),
            },
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(call) => call,
                // the sender cannot disconnect while we hold a clone, so
                // an error here is the deadline expiring
                Err(_) => {
                    self.shared.remove_call(seq);
                    return Err(Error::CallFailed("deadline exceeded".to_owned()));
                }
            },
        };
        call.into_reply()
    }

    /// Whether the connection has neither been closed nor torn down.
    /// Advisory: the state may change right after the answer.
    pub fn is_available(&self) -> bool {
        let inner = self.shared.mu.lock().unwrap();
        !inner.shutdown && !inner.closing
    }

    /// Close the connection. Pending calls fail as the reader observes
    /// the closed stream; a second close reports [`Error::Shutdown`].
    pub fn close(&self) -> Result<(), Error> {
        {
            let mut inner = self.shared.mu.lock().unwrap();
            if inner.closing {
                return Err(Error::Shutdown);
            }
            inner.closing = true;
        }
        self.sock.lock().unwrap().shutdown().map_err(Error::Io)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Ok(sock) = self.sock.lock() {
            sock.shutdown().ok();
        }
        if let Some(handle) = self.receiver.take() {
            unsafe { handle.coroutine().cancel() };
            handle.join().ok();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("content", &self.shared.content)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn dial_timeout<F>(dial: F, opt: Options) -> Result<Client, Error>
where
    F: FnOnce(&Options) -> Result<Client, Error> + Send + 'static,
{
    let connect_timeout = opt.connect_timeout;
    let (tx, rx) = mpsc::channel();
    go!(move || {
        // a failed send drops the fresh client, closing its connection
        let _ = tx.send(dial(&opt));
    });

    if connect_timeout.is_zero() {
        return match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::Shutdown),
        };
    }
    match rx.recv_timeout(connect_timeout) {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectTimeout(connect_timeout)),
    }
}
