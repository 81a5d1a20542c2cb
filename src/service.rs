//! Service registration and dispatch.
//!
//! A [`Service`] is a named bundle of methods built with
//! [`ServiceBuilder`]. Each registered handler has the fixed shape
//! `Fn(A, &mut P) -> Result<(), MethodError>`: the argument is decoded
//! fresh for every request, the reply starts from `P::default()`, and
//! both cross the wire in the connection's negotiated content type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::ContentType;
use crate::errors::{Error, MethodError};

type MethodShim = Box<dyn Fn(ContentType, &[u8]) -> Result<Vec<u8>, Error> + Send + Sync>;

/// Compiled descriptor of one dispatchable method.
pub struct MethodType {
    name: String,
    shim: MethodShim,
    num_calls: AtomicU64,
}

impl MethodType {
    /// The method's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodType")
            .field("name", &self.name)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

/// Builder assembling a [`Service`] out of typed method handlers.
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
    err: Option<Error>,
}

impl ServiceBuilder {
    /// Start a service under the given name.
    ///
    /// Service names follow type-name convention: an identifier starting
    /// with an uppercase letter. Validation is deferred to
    /// [`build`](Self::build).
    pub fn new(name: impl Into<String>) -> Self {
        ServiceBuilder {
            name: name.into(),
            methods: HashMap::new(),
            err: None,
        }
    }

    /// Register one method handler.
    ///
    /// The handler receives the decoded argument and a mutable reference
    /// to a freshly defaulted reply value; returning a [`MethodError`]
    /// turns into a per-call error reply on the wire.
    pub fn method<A, P, F>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + 'static,
        P: Serialize + Default + 'static,
        F: Fn(A, &mut P) -> Result<(), MethodError> + Send + Sync + 'static,
    {
        if self.err.is_some() {
            return self;
        }
        if !is_exported_name(name) {
            self.err = Some(Error::InvalidMethodName(name.to_owned()));
            return self;
        }

        let shim: MethodShim = Box::new(move |content, body| {
            let argv: A = content
                .decode(body)
                .map_err(|e| Error::ServerDeserialize(e.to_string()))?;
            let mut replyv = P::default();
            handler(argv, &mut replyv).map_err(|e| Error::Status(e.to_string()))?;
            content
                .encode(&replyv)
                .map_err(|e| Error::ServerSerialize(e.to_string()))
        });

        let mtype = Arc::new(MethodType {
            name: name.to_owned(),
            shim,
            num_calls: AtomicU64::new(0),
        });
        if self.methods.insert(name.to_owned(), mtype).is_some() {
            self.err = Some(Error::DuplicateMethod(name.to_owned()));
        }
        self
    }

    /// Validate the accumulated registrations and produce the service.
    pub fn build(self) -> Result<Service, Error> {
        if !is_exported_name(&self.name) {
            return Err(Error::InvalidServiceName(self.name));
        }
        if let Some(err) = self.err {
            return Err(err);
        }
        for method in self.methods.keys() {
            info!("rpc server: register {}.{}", self.name, method);
        }
        Ok(Service {
            name: Arc::from(self.name),
            methods: Arc::new(self.methods),
        })
    }
}

/// A registered receiver: a name plus its dispatchable methods.
///
/// Clones share the method table and call counters, so a handle kept
/// around after registration still observes dispatch activity.
#[derive(Clone)]
pub struct Service {
    name: Arc<str>,
    methods: Arc<HashMap<String, Arc<MethodType>>>,
}

impl Service {
    /// The registered service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look a method up by name.
    pub fn method(&self, name: &str) -> Option<Arc<MethodType>> {
        self.methods.get(name).cloned()
    }

    /// Invoke a method: bump its counter, decode the argument, run the
    /// handler, encode the reply.
    pub fn call(
        &self,
        mtype: &MethodType,
        content: ContentType,
        body: &[u8],
    ) -> Result<Vec<u8>, Error> {
        mtype.num_calls.fetch_add(1, Ordering::Relaxed);
        (mtype.shim)(content, body)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn is_exported_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    fn sum_service() -> Service {
        ServiceBuilder::new("Foo")
            .method("Sum", |args: Args, reply: &mut i64| {
                *reply = args.num1 + args.num2;
                Ok(())
            })
            .build()
            .unwrap()
    }

    #[test]
    fn registers_methods_by_name() {
        let svc = sum_service();
        assert_eq!(svc.name(), "Foo");
        assert!(svc.method("Sum").is_some());
        assert!(svc.method("Product").is_none());
    }

    #[test]
    fn call_decodes_invokes_and_counts() {
        let svc = sum_service();
        let mtype = svc.method("Sum").unwrap();

        for content in [ContentType::Bincode, ContentType::Json] {
            let body = content.encode(&Args { num1: 1, num2: 3 }).unwrap();
            let reply = svc.call(&mtype, content, &body).unwrap();
            let sum: i64 = content.decode(&reply).unwrap();
            assert_eq!(sum, 4);
        }
        assert_eq!(mtype.num_calls(), 2);
    }

    #[test]
    fn handler_error_becomes_status() {
        let svc = ServiceBuilder::new("Math")
            .method("Div", |args: Args, reply: &mut i64| {
                if args.num2 == 0 {
                    return Err(MethodError::new("divide by zero"));
                }
                *reply = args.num1 / args.num2;
                Ok(())
            })
            .build()
            .unwrap();
        let mtype = svc.method("Div").unwrap();
        let body = ContentType::Bincode
            .encode(&Args { num1: 1, num2: 0 })
            .unwrap();
        let err = svc.call(&mtype, ContentType::Bincode, &body).unwrap_err();
        assert_eq!(err.to_string(), "divide by zero");
    }

    #[test]
    fn bad_argument_payload_is_a_deserialize_error() {
        let svc = sum_service();
        let mtype = svc.method("Sum").unwrap();
        let err = svc
            .call(&mtype, ContentType::Json, b"{ not json")
            .unwrap_err();
        assert!(matches!(err, Error::ServerDeserialize(_)));
    }

    #[test]
    fn reply_values_are_fresh_per_call() {
        let svc = ServiceBuilder::new("Log")
            .method("Append", |item: String, reply: &mut Vec<String>| {
                reply.push(item);
                Ok(())
            })
            .build()
            .unwrap();
        let mtype = svc.method("Append").unwrap();

        for item in ["a", "b"] {
            let body = ContentType::Json.encode(item).unwrap();
            let reply = svc.call(&mtype, ContentType::Json, &body).unwrap();
            let entries: Vec<String> = ContentType::Json.decode(&reply).unwrap();
            // no state leaks over from the previous request
            assert_eq!(entries, vec![item.to_owned()]);
        }
    }

    #[test]
    fn names_must_be_exported_style() {
        let err = ServiceBuilder::new("foo")
            .method("Sum", |_: i64, _: &mut i64| Ok(()))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidServiceName(_)));

        let err = ServiceBuilder::new("Foo")
            .method("sum", |_: i64, _: &mut i64| Ok(()))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMethodName(_)));
    }

    #[test]
    fn duplicate_methods_are_rejected() {
        let err = ServiceBuilder::new("Foo")
            .method("Sum", |_: i64, _: &mut i64| Ok(()))
            .method("Sum", |_: i64, _: &mut i64| Ok(()))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateMethod(_)));
    }
}
