//! plexrpc is a small RPC framework for rust based on coroutines: one
//! client/server pair multiplexes many concurrent calls over a single
//! full-duplex byte stream.
//!
//! ## How a call travels
//! A caller hands the client a method name and an argument value. The
//! client stamps the request with a fresh sequence number, writes it
//! through the connection's codec and parks the call in a pending table.
//! On the server the request is decoded, routed to the registered
//! handler by its `"Service.Method"` name and answered on a coroutine of
//! its own, so a slow handler never holds up the connection. Whenever
//! the reply frame comes back, the client's reader looks the sequence
//! number up in the pending table and wakes exactly that caller.
//!
//! plexrpc keeps the moving parts explicit rather than generated: a
//! [`Service`] is built from named handler closures, a [`Server`] serves
//! registered services over tcp (or unix sockets), and a [`Client`]
//! pipelines any number of concurrent calls over one connection, matching
//! replies back by sequence number. Frames travel through a pluggable
//! codec negotiated per connection ([`Options`]): compact binary by
//! default, plain JSON as the text alternative. Any serde-serializable
//! type can cross the wire as argument or reply.
//!
//! Example usage:
//!
//! ```rust
//! use std::sync::Arc;
//! use plexrpc::{Client, Server, ServiceBuilder};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = ServiceBuilder::new("Arith")
//!         .method("Sum", |args: Args, reply: &mut i64| {
//!             *reply = args.num1 + args.num2;
//!             Ok(())
//!         })
//!         .build()?;
//!
//!     let server = Arc::new(Server::new());
//!     server.register(service)?;
//!     let instance = server.start("127.0.0.1:0")?;
//!     let addr = instance.local_addr().unwrap();
//!
//!     let client = Client::connect(addr)?;
//!     let sum: i64 = client.call("Arith.Sum", &Args { num1: 1, num2: 3 })?;
//!     assert_eq!(sum, 4);
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]

/// Client side: dialing, call multiplexing, deadlines.
mod client;
/// Wire protocol: header, codecs and the codec registry.
pub mod codec;
/// Provides the error types.
mod errors;
/// Connection negotiation record.
mod options;
/// Server side: accept loop and request dispatch.
mod server;
/// Service registration and dispatch table.
mod service;

pub use client::{Call, Client, Done};
pub use codec::{ContentType, Header, Transport};
pub use errors::{Error, MethodError};
pub use options::{Options, MAGIC_NUMBER};
pub use server::{Server, ServerInstance};
pub use service::{MethodType, Service, ServiceBuilder};
