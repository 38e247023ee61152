use scs_transport::config::{NetworkConfig, ServerConfig};
use scs_transport::error::{ProtocolError, Result};
use scs_transport::protocol::message::{Message, MessageBody};
use scs_transport::service::client::ScsClient;
use scs_transport::service::daemon::ScsServer;
use serial_test::serial;
use std::env;
use std::fs;
use std::time::Duration;
use tracing::Level;

const ENV_KEYS: &[&str] = &[
    "SCS_SERVER_ADDRESS",
    "SCS_CLIENT_ADDRESS",
    "SCS_CONNECTION_TIMEOUT_MS",
    "SCS_KEEPALIVE_INTERVAL_MS",
    "SCS_RESPONSE_TIMEOUT_MS",
    "SCS_QUEUE_CAPACITY",
    "SCS_LOG_LEVEL",
];

fn clear_env() {
    for key in ENV_KEYS {
        env::remove_var(key);
    }
}

#[test]
fn test_config_loading_from_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("scs.toml");
    fs::write(
        &path,
        r#"
        [server]
        address = "127.0.0.1:9999"
        max_connections = 500

        [client]
        address = "127.0.0.1:9999"
        connection_timeout = 5000
        keepalive_interval = 10000
        keepalive_idle_threshold = 20000

        [messenger]
        response_timeout = 15000
        queue_capacity = 128

        [transport]
        max_payload_size = 8388608
        no_delay = false

        [logging]
        app_name = "config-test"
        log_level = "debug"
        json_format = true
        "#,
    )?;

    let config = NetworkConfig::from_file(&path)?;

    assert_eq!(config.server.address, "127.0.0.1:9999");
    assert_eq!(config.server.max_connections, 500);
    assert_eq!(config.client.connection_timeout, Duration::from_millis(5000));
    assert_eq!(config.client.keepalive_interval, Duration::from_secs(10));
    assert_eq!(config.client.keepalive_idle_threshold, Duration::from_secs(20));
    assert_eq!(config.messenger.response_timeout, Duration::from_secs(15));
    assert_eq!(config.messenger.queue_capacity, Some(128));
    assert_eq!(config.transport.max_payload_size, 8_388_608);
    assert!(!config.transport.no_delay);
    assert_eq!(config.logging.app_name, "config-test");
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert!(config.logging.json_format);
    Ok(())
}

#[test]
fn test_malformed_file_is_a_config_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[client]\nconnection_timeout = \"soon\"\n")?;

    assert!(matches!(
        NetworkConfig::from_file(&path),
        Err(ProtocolError::Config(_))
    ));
    Ok(())
}

#[test]
#[serial]
fn test_env_overrides() -> Result<()> {
    clear_env();
    env::set_var("SCS_SERVER_ADDRESS", "127.0.0.1:8888");
    env::set_var("SCS_CONNECTION_TIMEOUT_MS", "10000");
    env::set_var("SCS_KEEPALIVE_INTERVAL_MS", "7500");
    env::set_var("SCS_RESPONSE_TIMEOUT_MS", "2500");
    env::set_var("SCS_QUEUE_CAPACITY", "64");
    env::set_var("SCS_LOG_LEVEL", "trace");

    let config = NetworkConfig::from_env();
    clear_env();
    let config = config?;

    assert_eq!(config.server.address, "127.0.0.1:8888");
    assert_eq!(config.client.connection_timeout, Duration::from_secs(10));
    assert_eq!(config.client.keepalive_interval, Duration::from_millis(7500));
    assert_eq!(config.messenger.response_timeout, Duration::from_millis(2500));
    assert_eq!(config.messenger.queue_capacity, Some(64));
    assert_eq!(config.logging.log_level, Level::TRACE);
    // Untouched values keep their defaults
    assert_eq!(config.client.keepalive_idle_threshold, Duration::from_secs(60));
    Ok(())
}

#[test]
#[serial]
fn test_malformed_env_value_is_rejected() {
    clear_env();
    env::set_var("SCS_RESPONSE_TIMEOUT_MS", "ten seconds");
    let result = NetworkConfig::from_env();
    clear_env();

    match result {
        Err(ProtocolError::Config(reason)) => assert!(reason.contains("SCS_RESPONSE_TIMEOUT_MS")),
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn test_save_and_reload() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("saved.toml");

    let custom = NetworkConfig::default_with_overrides(|cfg| {
        cfg.server.address = "0.0.0.0:7000".to_string();
        cfg.messenger.response_timeout = Duration::from_millis(1234);
        cfg.logging.log_level = Level::TRACE;
        cfg.logging.log_dir = Some("/var/log/scs".to_string());
    });
    custom.save_to_file(&path)?;

    let reloaded = NetworkConfig::from_file(&path)?;
    assert_eq!(reloaded, custom);
    Ok(())
}

#[tokio::test]
async fn test_config_drives_server_and_client() -> Result<()> {
    let mut config = NetworkConfig::default_with_overrides(|cfg| {
        cfg.server = ServerConfig {
            address: "tcp://127.0.0.1:0".to_string(),
            max_connections: 4,
        };
        cfg.client.connection_timeout = Duration::from_secs(2);
    });

    let server = ScsServer::from_config(&config)?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    server.on_client_connected(move |client| {
        let tx = tx.clone();
        client
            .on_message(move |message| {
                let _ = tx.send(message);
            })
            .unwrap();
    });
    server.start().await?;

    config.client.address = server
        .local_addr()
        .ok_or(ProtocolError::NotConnected)?
        .to_string();
    let client = ScsClient::from_config(&config)?;
    client.connect().await?;
    client.send(Message::text("configured")).await?;

    let received = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .map_err(|_| ProtocolError::Timeout)?
        .ok_or(ProtocolError::ConnectionClosed)?;
    assert_eq!(received.body, MessageBody::Text("configured".into()));

    client.disconnect().await;
    server.stop().await;
    Ok(())
}
