use scs_transport::config::NetworkConfig;
use scs_transport::error::Result;
use scs_transport::service::client::ScsClient;
use scs_transport::service::messenger::RequestReplyMessenger;
use scs_transport::service::proxy::{create_service_proxy, RemoteInterface, ServiceProxy};
use scs_transport::utils::logging::init_logging;
use std::sync::Arc;
use tracing::{error, info};

struct Calculator {
    proxy: ServiceProxy,
}

impl RemoteInterface for Calculator {
    const SERVICE_NAME: &'static str = "Calculator";

    fn from_proxy(proxy: ServiceProxy) -> Self {
        Self { proxy }
    }
}

impl Calculator {
    async fn call(&self, method: &str, a: i64, b: i64) -> Result<i64> {
        self.proxy.invoke(method, (a, b)).await
    }
}

/// Usage: scs_client <Add|Subtract|Multiply|Divide> <a> <b>
fn parse_args() -> Option<(String, i64, i64)> {
    let mut args = std::env::args().skip(1);
    let method = args.next()?;
    let a = args.next()?.parse().ok()?;
    let b = args.next()?.parse().ok()?;
    Some((method, a, b))
}

async fn run(method: &str, a: i64, b: i64) -> Result<()> {
    let config = NetworkConfig::from_env()?;
    init_logging(&config.logging);

    let client = Arc::new(ScsClient::from_config(&config)?);
    let messenger = RequestReplyMessenger::new(client.clone(), config.messenger.clone());
    messenger.start()?;
    client.connect().await?;

    let calculator: Calculator = create_service_proxy(&messenger);
    let result = calculator.call(method, a, b).await;

    messenger.stop();
    client.disconnect().await;

    let value = result?;
    info!(method, a, b, value, "Call completed");
    println!("{value}");
    Ok(())
}

#[tokio::main]
async fn main() {
    let Some((method, a, b)) = parse_args() else {
        eprintln!("usage: scs_client <Add|Subtract|Multiply|Divide> <a> <b>");
        std::process::exit(2);
    };

    if let Err(e) = run(&method, a, b).await {
        error!(error = %e, "Call failed");
        eprintln!("scs_client: {e}");
        std::process::exit(1);
    }
}
