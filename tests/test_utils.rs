#![allow(dead_code)]

use scs_transport::config::{ClientConfig, MessengerConfig, ServerConfig, TransportConfig};
use scs_transport::error::Result;
use scs_transport::protocol::dispatcher::{MethodTable, ServiceDispatcher};
use scs_transport::protocol::message::RemoteException;
use scs_transport::service::client::ScsClient;
use scs_transport::service::daemon::ScsServer;
use scs_transport::service::messenger::RequestReplyMessenger;
use scs_transport::service::proxy::{RemoteInterface, ServiceProxy};
use scs_transport::transport::Endpoint;
use std::sync::Arc;
use std::time::Duration;

/// Typed stand-in for the calculator service hosted by [`start_calculator_server`]
pub struct Calculator {
    proxy: ServiceProxy,
}

impl RemoteInterface for Calculator {
    const SERVICE_NAME: &'static str = "Calculator";

    fn from_proxy(proxy: ServiceProxy) -> Self {
        Self { proxy }
    }
}

impl Calculator {
    pub async fn add(&self, a: i32, b: i32) -> Result<i32> {
        self.proxy.invoke("Add", (a, b)).await
    }

    pub async fn divide(&self, a: i32, b: i32) -> Result<i32> {
        self.proxy.invoke("Divide", (a, b)).await
    }

    pub async fn sleep_then_echo(&self, millis: u64, value: String) -> Result<String> {
        self.proxy.invoke("SleepThenEcho", (millis, value)).await
    }

    pub async fn square_root(&self, value: f64) -> Result<f64> {
        self.proxy.invoke("SquareRoot", (value,)).await
    }
}

pub fn calculator_dispatcher() -> Arc<ServiceDispatcher> {
    let table = MethodTable::new();
    table
        .register("Add", |(a, b): (i32, i32)| async move { Ok(a + b) })
        .register("Divide", |(a, b): (i32, i32)| async move {
            a.checked_div(b)
                .ok_or_else(|| RemoteException::new("DivideByZero", "division by zero"))
        })
        .register("SleepThenEcho", |(millis, value): (u64, String)| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(value)
        });

    let dispatcher = Arc::new(ServiceDispatcher::new());
    dispatcher.register("Calculator", table);
    dispatcher
}

/// Start a server on an ephemeral port hosting the calculator
pub async fn start_calculator_server(endpoint: Endpoint) -> ScsServer {
    scs_transport::utils::logging::setup_default_logging();
    let server = ScsServer::new(endpoint, ServerConfig::default(), TransportConfig::default());
    server.host_services(calculator_dispatcher(), MessengerConfig::default());
    server.start().await.unwrap();
    server
}

pub fn tcp_any_port() -> Endpoint {
    Endpoint::Tcp("127.0.0.1:0".to_string())
}

/// Connect a client to `server` and wrap it in a started messenger
pub async fn connect_messenger(server: &ScsServer) -> (Arc<ScsClient>, RequestReplyMessenger) {
    let client = Arc::new(ScsClient::new(
        server.local_addr().unwrap(),
        ClientConfig::default(),
        TransportConfig::default(),
    ));
    let messenger = RequestReplyMessenger::new(client.clone(), MessengerConfig::default());
    messenger.start().unwrap();
    client.connect().await.unwrap();
    (client, messenger)
}

/// Poll `condition` until it holds or `limit` passes
pub async fn eventually<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
