//! Service registry
//!
//! A [`Service`] wraps a receiver object and a table of its callable methods.
//! Methods are registered explicitly through [`ServiceBuilder::method`]; each
//! one is stored as a type-erased thunk that decodes the argument, runs the
//! handler, and encodes the reply with the connection's codec.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::protocol::{CodecType, Error, Result};

/// Decoded call, ready to run; resolves to the encoded reply or an error text
pub(crate) type Invocation = Pin<Box<dyn Future<Output = std::result::Result<Bytes, String>> + Send>>;

type Handler = dyn Fn(CodecType, &[u8]) -> Result<Invocation> + Send + Sync;

/// One callable method of a service
pub struct MethodType {
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
    handler: Box<Handler>,
}

impl MethodType {
    /// Name of the argument type
    #[must_use]
    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    /// Name of the reply type
    #[must_use]
    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Number of times the method has been invoked
    #[must_use]
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Decode an argument body and bind it to the handler
    pub(crate) fn prepare(&self, codec: CodecType, body: &[u8]) -> Result<Invocation> {
        (self.handler)(codec, body)
    }

    /// Run a prepared invocation
    pub(crate) async fn call(&self, invocation: Invocation) -> std::result::Result<Bytes, String> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        invocation.await
    }
}

impl fmt::Debug for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodType")
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish_non_exhaustive()
    }
}

/// A registered service: a name and its methods
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
}

impl Service {
    /// Start a service named after the receiver's type
    ///
    /// `Service::builder(Arith)` yields a service called `Arith`.
    pub fn builder<S>(receiver: S) -> ServiceBuilder<S>
    where
        S: Send + Sync + 'static,
    {
        Self::named(type_name_of::<S>(), receiver)
    }

    /// Start a service with an explicit name
    pub fn named<S>(name: impl Into<String>, receiver: S) -> ServiceBuilder<S>
    where
        S: Send + Sync + 'static,
    {
        ServiceBuilder {
            name: name.into(),
            receiver: Arc::new(receiver),
            methods: Vec::new(),
        }
    }

    /// Service name used in `Service.Method`
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method
    #[must_use]
    pub fn method(&self, name: &str) -> Option<&Arc<MethodType>> {
        self.methods.get(name)
    }

    /// Names of all registered methods
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

/// Collects the methods of a service before validation
pub struct ServiceBuilder<S> {
    name: String,
    receiver: Arc<S>,
    methods: Vec<(String, MethodType)>,
}

impl<S> ServiceBuilder<S>
where
    S: Send + Sync + 'static,
{
    /// Register a method
    ///
    /// The handler receives the shared receiver and the decoded argument and
    /// returns the reply, or an error whose text is sent back to the caller.
    #[must_use]
    pub fn method<A, R, E, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let receiver = Arc::clone(&self.receiver);
        let thunk = move |codec: CodecType, body: &[u8]| -> Result<Invocation> {
            let args: A = codec.decode(body)?;
            let reply = handler(Arc::clone(&receiver), args);
            Ok(Box::pin(async move {
                match reply.await {
                    Ok(reply) => codec.encode(&reply).map_err(|err| err.to_string()),
                    Err(err) => Err(err.to_string()),
                }
            }))
        };

        self.methods.push((
            name.into(),
            MethodType {
                arg_type: std::any::type_name::<A>(),
                reply_type: std::any::type_name::<R>(),
                num_calls: AtomicU64::new(0),
                handler: Box::new(thunk),
            },
        ));
        self
    }

    /// Validate names and produce the service
    pub fn build(self) -> Result<Service> {
        if !is_exported(&self.name) {
            return Err(Error::InvalidServiceName(self.name));
        }

        let mut methods = HashMap::with_capacity(self.methods.len());
        for (name, method) in self.methods {
            if !is_exported(&name) {
                return Err(Error::InvalidMethodName(name));
            }
            if methods.contains_key(&name) {
                return Err(Error::DuplicateMethod(name));
            }
            info!(service = %self.name, method = %name, "rpc server: register {}.{}", self.name, name);
            methods.insert(name, Arc::new(method));
        }

        Ok(Service {
            name: self.name,
            methods,
        })
    }
}

/// Exported identifier: uppercase first letter, then letters, digits or `_`
fn is_exported(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_uppercase() => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Last path segment of a type name, without generic arguments
fn type_name_of<S>() -> &'static str {
    let full = std::any::type_name::<S>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
