//! Server side: accept loop, option negotiation and the per-connection
//! dispatch loop.
//!
//! Every connection gets its own coroutine; every request read off a
//! connection gets its own handler coroutine. Reply frames are
//! serialized through a per-connection sending mutex that owns the write
//! half of the codec.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{catch_unwind, AssertUnwindSafe};
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use co_managed::Manager;
use log::{error, info, warn};
use may::net::TcpListener;
#[cfg(unix)]
use may::os::unix::net::UnixListener;
use may::sync::{mpsc, Mutex};
use may::{coroutine, go};

use crate::codec::{self, CodecRead, CodecWrite, ContentType, Header, Transport};
use crate::errors::Error;
use crate::options::{self, MAGIC_NUMBER};
use crate::service::{MethodType, Service};

macro_rules! t {
    ($e: expr) => {
        match $e {
            Ok(val) => val,
            Err(err) => {
                error!("call = {:?}\nerr = {:?}", stringify!($e), err);
                continue;
            }
        }
    };
}

/// The rpc server: a registry of services plus connection serving.
pub struct Server {
    services: Mutex<HashMap<String, Service>>,
    lenient_magic: bool,
}

impl Server {
    /// Create a server with an empty registry.
    ///
    /// Handshakes carrying the wrong magic number are refused; see
    /// [`allow_magic_mismatch`](Self::allow_magic_mismatch).
    pub fn new() -> Server {
        Server {
            services: Mutex::new(HashMap::new()),
            lenient_magic: false,
        }
    }

    /// Compatibility switch: log mismatched magic numbers instead of
    /// refusing the connection.
    pub fn allow_magic_mismatch(&mut self, allow: bool) {
        self.lenient_magic = allow;
    }

    /// Publish a service. Registration is insert-once: a second service
    /// under the same name is rejected and the registry is unchanged.
    pub fn register(&self, service: Service) -> Result<(), Error> {
        let mut services = self.services.lock().unwrap();
        if services.contains_key(service.name()) {
            return Err(Error::ServiceAlreadyDefined(service.name().to_owned()));
        }
        services.insert(service.name().to_owned(), service);
        Ok(())
    }

    fn find_service(&self, service_method: &str) -> Result<(Service, Arc<MethodType>), Error> {
        let dot = service_method
            .rfind('.')
            .ok_or_else(|| Error::IllFormedServiceMethod(service_method.to_owned()))?;
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);

        let svc = self
            .services
            .lock()
            .unwrap()
            .get(service_name)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(service_name.to_owned()))?;
        let mtype = svc
            .method(method_name)
            .ok_or_else(|| Error::MethodNotFound(method_name.to_owned()))?;
        Ok((svc, mtype))
    }

    /// Bind a tcp listener and serve it on a background coroutine.
    ///
    /// Each accepted connection runs on its own managed coroutine; the
    /// returned [`ServerInstance`] cancels the acceptor and its
    /// connections when dropped.
    pub fn start<L: ToSocketAddrs>(self: Arc<Self>, addr: L) -> io::Result<ServerInstance> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let server = self;
        let handle = go!(
            coroutine::Builder::new().name("RpcTcpServer".to_owned()),
            move || {
                let manager = Manager::new();
                for stream in listener.incoming() {
                    let stream = t!(stream);
                    t!(stream.set_nodelay(true));
                    let server = server.clone();
                    manager.add(move |_| server.serve_transport(Box::new(stream)));
                }
            }
        )?;
        Ok(ServerInstance {
            handle: Some(handle),
            local_addr: Some(local_addr),
        })
    }

    /// Bind a unix domain socket and serve it on a background coroutine.
    ///
    /// The socket file is removed when the instance stops.
    #[cfg(unix)]
    pub fn start_uds<P: AsRef<Path>>(self: Arc<Self>, path: P) -> io::Result<ServerInstance> {
        struct AutoDrop(UnixListener, PathBuf);
        impl Drop for AutoDrop {
            fn drop(&mut self) {
                std::fs::remove_file(&self.1).ok();
            }
        }

        std::fs::remove_file(&path).ok();
        let listener = AutoDrop(UnixListener::bind(&path)?, path.as_ref().to_owned());
        let server = self;
        let handle = go!(
            coroutine::Builder::new().name("RpcUdsServer".to_owned()),
            move || {
                let manager = Manager::new();
                for stream in listener.0.incoming() {
                    let stream = t!(stream);
                    let server = server.clone();
                    manager.add(move |_| server.serve_transport(Box::new(stream)));
                }
            }
        )?;
        Ok(ServerInstance {
            handle: Some(handle),
            local_addr: None,
        })
    }

    /// Serve one connection: negotiate options, open the codec, dispatch
    /// until the read side fails.
    fn serve_transport(&self, mut stream: Box<dyn Transport>) {
        let opt = match options::read_options(&mut stream) {
            Ok(opt) => opt,
            Err(e) => {
                error!("rpc server: options error: {e}");
                return;
            }
        };

        if opt.magic_number != MAGIC_NUMBER {
            if self.lenient_magic {
                warn!("rpc server: unexpected magic number {:#x}", opt.magic_number);
            } else {
                error!("rpc server: invalid magic number {:#x}", opt.magic_number);
                return;
            }
        }

        let factory = match codec::codec_factory(&opt.codec_type) {
            Some(factory) => factory,
            None => {
                error!("rpc server: invalid codec type {}", opt.codec_type);
                return;
            }
        };
        let (reader, writer) = match (factory.open)(stream) {
            Ok(pair) => pair,
            Err(e) => {
                error!("rpc server: codec open error: {e}");
                return;
            }
        };
        self.serve_codec(reader, writer, factory.content, opt.handle_timeout);
    }

    fn serve_codec(
        &self,
        mut reader: Box<dyn CodecRead>,
        writer: Box<dyn CodecWrite>,
        content: ContentType,
        handle_timeout: Duration,
    ) {
        let sending = Arc::new(Mutex::new(writer));
        // each handler holds a sender; eof on the channel means all done
        let (done_tx, done_rx) = mpsc::channel::<()>();

        loop {
            match self.read_request(&mut *reader) {
                Ok(req) => {
                    let sending = sending.clone();
                    let done_tx = done_tx.clone();
                    go!(move || {
                        handle_request(req, content, handle_timeout, &sending);
                        drop(done_tx);
                    });
                }
                Err(ReadRequestFailure::Rejected { mut header, err }) => {
                    header.error = err.to_string();
                    send_response(&sending, &header, &placeholder(content));
                }
                Err(ReadRequestFailure::Fatal(e)) => {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        info!("rpc server: connection closed");
                    } else {
                        error!("rpc server: read request error: {e}");
                    }
                    break;
                }
            }
        }

        drop(done_tx);
        while done_rx.recv().is_ok() {}
        sending.lock().unwrap().close().ok();
    }

    fn read_request(&self, reader: &mut dyn CodecRead) -> Result<Request, ReadRequestFailure> {
        let header = reader.read_header().map_err(ReadRequestFailure::Fatal)?;
        match self.find_service(&header.service_method) {
            Ok((svc, mtype)) => {
                let body = reader.read_body().map_err(ReadRequestFailure::Fatal)?;
                Ok(Request {
                    header,
                    svc,
                    mtype,
                    body,
                })
            }
            Err(err) => {
                // drain the body so the next header frame lines up
                reader.read_body().map_err(ReadRequestFailure::Fatal)?;
                Err(ReadRequestFailure::Rejected { header, err })
            }
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

struct Request {
    header: Header,
    svc: Service,
    mtype: Arc<MethodType>,
    body: Bytes,
}

enum ReadRequestFailure {
    /// The connection is unusable; the dispatch loop must stop.
    Fatal(io::Error),
    /// One request could not be dispatched; the loop carries on after an
    /// error reply.
    Rejected { header: Header, err: Error },
}

fn handle_request(
    req: Request,
    content: ContentType,
    handle_timeout: Duration,
    sending: &Mutex<Box<dyn CodecWrite>>,
) {
    let Request {
        mut header,
        svc,
        mtype,
        body,
    } = req;

    let outcome = if handle_timeout.is_zero() {
        invoke(&svc, &mtype, content, &body)
    } else {
        let (tx, rx) = mpsc::channel();
        let svc = svc.clone();
        let mtype = mtype.clone();
        let body = body.clone();
        go!(move || {
            let _ = tx.send(invoke(&svc, &mtype, content, &body));
        });
        match rx.recv_timeout(handle_timeout) {
            Ok(outcome) => outcome,
            // the straggler's eventual result lands in a closed channel
            Err(_) => Err(Error::HandleTimeout(handle_timeout)),
        }
    };

    match outcome {
        Ok(reply) => send_response(sending, &header, &reply),
        Err(err) => {
            header.error = err.to_string();
            send_response(sending, &header, &placeholder(content));
        }
    }
}

fn invoke(svc: &Service, mtype: &MethodType, content: ContentType, body: &[u8]) -> Result<Vec<u8>, Error> {
    match catch_unwind(AssertUnwindSafe(|| svc.call(mtype, content, body))) {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::HandlerPanicked(mtype.name().to_owned())),
    }
}

fn placeholder(content: ContentType) -> Vec<u8> {
    content.encode(&()).unwrap_or_default()
}

fn send_response(sending: &Mutex<Box<dyn CodecWrite>>, header: &Header, body: &[u8]) {
    let mut writer = sending.lock().unwrap();
    if let Err(e) = writer.write(header, body) {
        error!("rpc server: write response error: {e}");
    }
}

/// Handle onto a running server loop.
///
/// Dropping the instance cancels the accept coroutine together with its
/// managed connection coroutines.
pub struct ServerInstance {
    handle: Option<coroutine::JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ServerInstance {
    /// The bound tcp address, if this instance serves tcp.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Wait until the serving coroutine stops.
    pub fn join(mut self) -> std::thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }

    /// Stop serving and wait for the acceptor to unwind.
    pub fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            unsafe { handle.coroutine().cancel() };
            handle.join().ok();
        }
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            unsafe { handle.coroutine().cancel() };
            handle.join().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceBuilder;

    fn sum_service() -> Service {
        ServiceBuilder::new("Foo")
            .method("Sum", |args: (i64, i64), reply: &mut i64| {
                *reply = args.0 + args.1;
                Ok(())
            })
            .build()
            .unwrap()
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let server = Server::new();
        server.register(sum_service()).unwrap();
        let err = server.register(sum_service()).unwrap_err();
        assert!(err.to_string().contains("service already defined"));
        // the first registration still resolves
        assert!(server.find_service("Foo.Sum").is_ok());
    }

    #[test]
    fn find_service_classifies_failures() {
        let server = Server::new();
        server.register(sum_service()).unwrap();

        assert!(server.find_service("Foo.Sum").is_ok());

        let err = server.find_service("FooSum").unwrap_err();
        assert!(err.to_string().contains("ill-formed"));

        let err = server.find_service("Bar.Sum").unwrap_err();
        assert!(err.to_string().contains("can't find service Bar"));

        let err = server.find_service("Foo.Product").unwrap_err();
        assert!(err.to_string().contains("can't find method Product"));
    }

    #[test]
    fn split_is_on_the_last_dot() {
        let server = Server::new();
        server.register(sum_service()).unwrap();
        // "Foo.Sum.Extra" asks service "Foo.Sum" for method "Extra"
        let err = server.find_service("Foo.Sum.Extra").unwrap_err();
        assert!(err.to_string().contains("can't find service Foo.Sum"));
    }
}
