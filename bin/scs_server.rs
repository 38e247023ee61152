use scs_transport::config::NetworkConfig;
use scs_transport::error::Result;
use scs_transport::protocol::dispatcher::{MethodTable, ServiceDispatcher};
use scs_transport::protocol::message::RemoteException;
use scs_transport::service::daemon::ScsServer;
use scs_transport::utils::logging::init_logging;
use std::sync::Arc;
use tracing::{error, info};

/// Load the config file named on the command line, or defaults, then apply `SCS_*` overrides
fn load_config() -> Result<NetworkConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let mut config = NetworkConfig::from_file(path)?;
            config.apply_env()?;
            Ok(config)
        }
        None => NetworkConfig::from_env(),
    }
}

fn calculator() -> MethodTable {
    let table = MethodTable::new();
    table
        .register("Add", |(a, b): (i64, i64)| async move {
            a.checked_add(b)
                .ok_or_else(|| RemoteException::new("Overflow", format!("{a} + {b} overflows")))
        })
        .register("Subtract", |(a, b): (i64, i64)| async move {
            a.checked_sub(b)
                .ok_or_else(|| RemoteException::new("Overflow", format!("{a} - {b} overflows")))
        })
        .register("Multiply", |(a, b): (i64, i64)| async move {
            a.checked_mul(b)
                .ok_or_else(|| RemoteException::new("Overflow", format!("{a} * {b} overflows")))
        })
        .register("Divide", |(a, b): (i64, i64)| async move {
            if b == 0 {
                return Err(RemoteException::new("DivideByZero", "division by zero"));
            }
            Ok(a / b)
        });
    table
}

async fn run() -> Result<()> {
    let config = load_config()?;
    init_logging(&config.logging);

    let dispatcher = Arc::new(ServiceDispatcher::new());
    dispatcher.register("Calculator", calculator());

    let server = ScsServer::from_config(&config)?;
    server.host_services(dispatcher, config.messenger.clone());
    server.on_client_connected(|client| {
        info!(client_id = client.id(), peer = %client.remote_endpoint(), "Client joined");
    });
    server.on_client_disconnected(|client| {
        info!(client_id = client.id(), "Client left");
    });
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, stopping server");
    server.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Server failed");
        eprintln!("scs_server: {e}");
        std::process::exit(1);
    }
}
