//! Client side of remote invocation.
//!
//! A remote interface is a plain struct wrapping a [`ServiceProxy`], with one
//! async method per remote method:
//!
//! ```rust,no_run
//! use scs_transport::error::Result;
//! use scs_transport::service::proxy::{RemoteInterface, ServiceProxy};
//!
//! struct Calculator {
//!     proxy: ServiceProxy,
//! }
//!
//! impl RemoteInterface for Calculator {
//!     const SERVICE_NAME: &'static str = "Calculator";
//!
//!     fn from_proxy(proxy: ServiceProxy) -> Self {
//!         Self { proxy }
//!     }
//! }
//!
//! impl Calculator {
//!     async fn add(&self, a: i32, b: i32) -> Result<i32> {
//!         self.proxy.invoke("Add", (a, b)).await
//!     }
//! }
//! ```
//!
//! and is obtained with [`create_service_proxy`]. Each call becomes one
//! `RemoteInvoke` request sent through the messenger; a remote exception in
//! the reply fails the call with [`ProtocolError::RemoteInvocation`].

use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::instrument;

use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::ToArguments;
use crate::protocol::message::{Message, MessageBody};
use crate::service::messenger::RequestReplyMessenger;

#[derive(Debug, Clone)]
pub struct ServiceProxy {
    messenger: RequestReplyMessenger,
    service_name: String,
    timeout: Option<Duration>,
}

impl ServiceProxy {
    pub fn new(messenger: RequestReplyMessenger, service_name: impl Into<String>) -> Self {
        Self {
            messenger,
            service_name: service_name.into(),
            timeout: None,
        }
    }

    /// Use `timeout` for every call instead of the messenger default
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Call `method` remotely and decode its return value as `R`
    #[instrument(skip(self, args), fields(service = %self.service_name))]
    pub async fn invoke<A, R>(&self, method: &str, args: A) -> Result<R>
    where
        A: ToArguments,
        R: DeserializeOwned,
    {
        let parameters = args.to_arguments()?;
        let request = Message::invoke(self.service_name.as_str(), method, parameters);
        let reply = self.messenger.send_and_wait(request, self.timeout).await?;

        match reply.body {
            MessageBody::RemoteInvokeReturn {
                remote_exception: Some(exception),
                ..
            } => Err(exception.into()),
            MessageBody::RemoteInvokeReturn { return_value, .. } => {
                return_value.unwrap_or_default().decode()
            }
            _ => Err(ProtocolError::UnexpectedMessage),
        }
    }
}

/// A typed stand-in for a remote service
pub trait RemoteInterface: Sized {
    const SERVICE_NAME: &'static str;

    fn from_proxy(proxy: ServiceProxy) -> Self;
}

/// Build the stand-in for `T`, sending its calls through `messenger`
pub fn create_service_proxy<T: RemoteInterface>(messenger: &RequestReplyMessenger) -> T {
    T::from_proxy(ServiceProxy::new(messenger.clone(), T::SERVICE_NAME))
}
