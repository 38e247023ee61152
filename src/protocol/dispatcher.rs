//! Server-side routing of remote invocations.
//!
//! A [`ServiceDispatcher`] maps service names to [`RemoteService`]
//! implementations. For each `RemoteInvoke` message it finds the service, lets
//! it run the named method, and builds the correlated `RemoteInvokeReturn`
//! carrying either the encoded return value or a [`RemoteException`].
//!
//! Services can be written by hand or assembled from closures with
//! [`MethodTable`], which decodes positional parameters into a typed tuple
//! before calling the closure.

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::protocol::message::{EncodedValue, Message, MessageBody, RemoteException};

/// Outcome of one method invocation
pub type InvokeResult = std::result::Result<EncodedValue, RemoteException>;

/// Encode positional parameters for an invocation
pub trait ToArguments {
    fn to_arguments(&self) -> Result<Vec<EncodedValue>>;
}

/// Decode positional parameters into typed values
pub trait FromArguments: Sized {
    fn from_arguments(parameters: &[EncodedValue]) -> Result<Self>;
}

macro_rules! impl_arguments {
    ($count:expr; $($name:ident : $idx:tt),*) => {
        impl<$($name: Serialize),*> ToArguments for ($($name,)*) {
            fn to_arguments(&self) -> Result<Vec<EncodedValue>> {
                Ok(vec![$(EncodedValue::encode(&self.$idx)?),*])
            }
        }

        impl<$($name: DeserializeOwned),*> FromArguments for ($($name,)*) {
            fn from_arguments(parameters: &[EncodedValue]) -> Result<Self> {
                if parameters.len() != $count {
                    return Err(ProtocolError::DeserializeError(format!(
                        "expected {} parameters, got {}",
                        $count,
                        parameters.len()
                    )));
                }
                Ok(($(parameters[$idx].decode::<$name>()?,)*))
            }
        }
    };
}

impl_arguments!(0;);
impl_arguments!(1; A: 0);
impl_arguments!(2; A: 0, B: 1);
impl_arguments!(3; A: 0, B: 1, C: 2);
impl_arguments!(4; A: 0, B: 1, C: 2, D: 3);
impl_arguments!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
impl_arguments!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

/// One inbound invocation, borrowed from the request message
#[derive(Debug, Clone, Copy)]
pub struct MethodCall<'a> {
    pub service: &'a str,
    pub method: &'a str,
    pub parameters: &'a [EncodedValue],
}

impl<'a> MethodCall<'a> {
    /// Decode the parameters; a count or type mismatch becomes `InvalidArguments`
    pub fn arguments<A: FromArguments>(&self) -> std::result::Result<A, RemoteException> {
        A::from_arguments(self.parameters).map_err(RemoteException::invalid_arguments)
    }

    pub fn method_not_found(&self) -> RemoteException {
        RemoteException::method_not_found(self.service, self.method)
    }
}

/// Encode a method's return value
pub fn encode_return<R: Serialize + ?Sized>(value: &R) -> InvokeResult {
    EncodedValue::encode(value).map_err(RemoteException::from)
}

/// A service reachable through remote invocation
pub trait RemoteService: Send + Sync + 'static {
    fn invoke<'a>(&'a self, call: MethodCall<'a>) -> BoxFuture<'a, InvokeResult>;
}

type MethodFn = dyn Fn(&[EncodedValue]) -> BoxFuture<'static, InvokeResult> + Send + Sync;

/// A service assembled from per-method closures
pub struct MethodTable {
    methods: RwLock<HashMap<String, Box<MethodFn>>>,
}

impl Default for MethodTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodTable {
    pub fn new() -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` under `method`, replacing any previous handler.
    ///
    /// `A` is the tuple of parameter types, e.g. `(i32, i32)`.
    pub fn register<A, R, F, Fut>(&self, method: &str, handler: F) -> &Self
    where
        A: FromArguments + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, RemoteException>> + Send + 'static,
    {
        let method_fn = move |parameters: &[EncodedValue]| -> BoxFuture<'static, InvokeResult> {
            match A::from_arguments(parameters) {
                Ok(args) => {
                    let pending = handler(args);
                    Box::pin(async move {
                        let value = pending.await?;
                        encode_return(&value)
                    })
                }
                Err(e) => Box::pin(future::ready(Err(RemoteException::invalid_arguments(e)))),
            }
        };

        self.methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), Box::new(method_fn));
        self
    }

    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl RemoteService for MethodTable {
    fn invoke<'a>(&'a self, call: MethodCall<'a>) -> BoxFuture<'a, InvokeResult> {
        let methods = self.methods.read().unwrap_or_else(PoisonError::into_inner);
        let pending: BoxFuture<'a, InvokeResult> = match methods.get(call.method) {
            Some(method) => method(call.parameters),
            None => Box::pin(future::ready(Err(call.method_not_found()))),
        };
        pending
    }
}

/// Routes `RemoteInvoke` messages to registered services
#[derive(Default)]
pub struct ServiceDispatcher {
    services: RwLock<HashMap<String, Arc<dyn RemoteService>>>,
}

impl ServiceDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: RemoteService>(&self, name: &str, service: S) {
        self.register_arc(name, Arc::new(service));
    }

    pub fn register_arc(&self, name: &str, service: Arc<dyn RemoteService>) {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), service);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    fn service(&self, name: &str) -> Option<Arc<dyn RemoteService>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Run the invocation carried by `request` and build its reply.
    ///
    /// Returns `None` for messages that are not invocations. A panic inside
    /// the service is reported to the caller as a `Panic` exception.
    pub async fn handle(&self, request: &Message) -> Option<Message> {
        let MessageBody::RemoteInvoke {
            service_name,
            method_name,
            parameters,
        } = &request.body
        else {
            return None;
        };

        debug!(
            service = %service_name,
            method = %method_name,
            params = parameters.len(),
            "Dispatching invocation"
        );

        let outcome = match self.service(service_name) {
            None => Err(RemoteException::service_not_found(service_name)),
            Some(service) => {
                let call = MethodCall {
                    service: service_name,
                    method: method_name,
                    parameters,
                };
                match catch_unwind(AssertUnwindSafe(|| service.invoke(call))) {
                    Ok(pending) => AssertUnwindSafe(pending).catch_unwind().await.unwrap_or_else(
                        |panic| Err(panic_exception(service_name, method_name, panic)),
                    ),
                    Err(panic) => Err(panic_exception(service_name, method_name, panic)),
                }
            }
        };

        if let Err(ex) = &outcome {
            debug!(
                service = %service_name,
                method = %method_name,
                error = %ex,
                "Invocation failed"
            );
        }
        Some(Message::invoke_return(request, outcome))
    }
}

fn panic_exception(service: &str, method: &str, panic: Box<dyn Any + Send>) -> RemoteException {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    warn!(service, method, detail = %detail, "Service panicked");
    RemoteException::new("Panic", format!("{service}.{method} panicked: {detail}"))
}
