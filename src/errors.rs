use std::io;
use std::time::Duration;

use thiserror::Error;

/// All errors that can surface while using the rpc framework.
#[derive(Debug, Error)]
pub enum Error {
    /// Any IO error on the underlying stream.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The negotiated codec tag is not known to the codec registry.
    #[error("invalid codec type {0}")]
    InvalidCodec(String),

    /// Dial plus handshake did not finish within the connect timeout.
    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    /// The synchronous call was abandoned before a reply arrived,
    /// typically because its deadline expired.
    #[error("rpc client: call failed: {0}")]
    CallFailed(String),

    /// The connection was already closed by the user or torn down after a
    /// transport failure.
    #[error("connection is shut down")]
    Shutdown,

    /// Error in serializing a client request.
    ///
    /// Typically this indicates a faulty implementation of `serde::Serialize`.
    #[error("serializing a client request err: {0}")]
    ClientSerialize(String),

    /// Error in deserializing a server response.
    #[error("deserializing a server response err: {0}")]
    ClientDeserialize(String),

    /// Error in deserializing a client request on the server.
    #[error("deserializing a client request err: {0}")]
    ServerDeserialize(String),

    /// Error in serializing a server response.
    #[error("serializing a server response err: {0}")]
    ServerSerialize(String),

    /// The reply header carried a server-side failure text.
    ///
    /// The text is surfaced exactly as the peer produced it.
    #[error("{0}")]
    Status(String),

    /// The server gave up on a request after the negotiated handle timeout.
    #[error("rpc server: request handle timeout: expect within {0:?}")]
    HandleTimeout(Duration),

    /// The request named no `"Service.Method"` pair.
    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormedServiceMethod(String),

    /// No service is registered under the requested name.
    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),

    /// The service exists but has no such method.
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    /// A service with the same name was registered before.
    #[error("rpc server: service already defined: {0}")]
    ServiceAlreadyDefined(String),

    /// The service name is not an exported-style identifier.
    #[error("rpc server: {0} is not a valid service name")]
    InvalidServiceName(String),

    /// The method name is not an exported-style identifier.
    #[error("rpc server: {0} is not a valid method name")]
    InvalidMethodName(String),

    /// Two methods were registered under the same name on one service.
    #[error("rpc server: duplicate method {0}")]
    DuplicateMethod(String),

    /// The user handler panicked; the request failed but the connection
    /// survives.
    #[error("rpc server: method {0} panicked")]
    HandlerPanicked(String),
}

/// An application error produced by a service method body.
///
/// Only its message crosses the wire: it travels in the reply header's
/// error field and reaches the caller as [`Error::Status`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct MethodError(String);

impl MethodError {
    /// Wrap a message into a method error.
    pub fn new(msg: impl Into<String>) -> Self {
        MethodError(msg.into())
    }
}

impl From<String> for MethodError {
    fn from(msg: String) -> Self {
        MethodError(msg)
    }
}

impl From<&str> for MethodError {
    fn from(msg: &str) -> Self {
        MethodError(msg.to_owned())
    }
}
