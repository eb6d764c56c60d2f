//! mrl-cli - command-line client for a remote MyRobotLab runtime.
//!
//! Connects to the WebGui message endpoint of a running instance, completes
//! the hello exchange and then watches, lists or calls remote services.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mrl_core::{callback, Args, BlockingConfig, Endpoint, EndpointConfig, ProtocolConfig};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "mrl-cli")]
#[command(about = "Command-line client for a remote MyRobotLab runtime")]
struct Cli {
    /// WebSocket URL of the remote message endpoint
    #[arg(long, default_value = ProtocolConfig::DEFAULT_URL)]
    url: String,

    /// Local endpoint id (generated when omitted)
    #[arg(long)]
    id: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Delay between two polls of a blocking call, in milliseconds
    #[arg(long, default_value_t = BlockingConfig::POLL_INTERVAL.as_millis() as u64)]
    blocking_interval_ms: u64,

    /// Number of polls before a blocking call times out
    #[arg(long, default_value_t = BlockingConfig::MAX_POLLS)]
    blocking_retries: u32,

    /// Seconds to wait for the remote hello
    #[arg(long, default_value = "10")]
    ready_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print registrations, releases and every message of registered services
    Watch,

    /// Wait for registrations, then list the registry
    Services {
        /// Only list services declaring this capability
        #[arg(long)]
        capability: Option<String>,

        /// Milliseconds to wait for registrations after the hello
        #[arg(long, default_value = "1500")]
        wait_ms: u64,
    },

    /// Fire-and-forget call
    Send {
        service: String,
        method: String,
        /// Arguments, parsed as JSON when valid, otherwise sent as strings
        args: Vec<String>,
    },

    /// Blocking call; prints the reply data
    Call {
        service: String,
        method: String,
        /// Arguments, parsed as JSON when valid, otherwise sent as strings
        args: Vec<String>,
    },
}

fn init_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn parse_args(raw: &[String]) -> Args {
    raw.iter()
        .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.clone())))
        .collect::<Vec<Value>>()
        .into()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let mut config = EndpointConfig::new()
        .with_url(cli.url.as_str())
        .with_poll_interval(Duration::from_millis(cli.blocking_interval_ms))
        .with_max_polls(cli.blocking_retries);
    if let Some(id) = &cli.id {
        config = config.with_local_id(id.as_str());
    }
    let endpoint = Endpoint::new(config).context("Invalid configuration")?;

    // Registrations arrive right after the hello, so listen before connecting
    let (registered_tx, registered_rx) = mpsc::unbounded_channel();
    endpoint.subscribe_registered(move |record| {
        let _ = registered_tx.send((record.full_name(), record.type_key.clone()));
    });
    endpoint.subscribe_connected(|connected| {
        if connected {
            info!("Connection open");
        } else {
            warn!("Connection closed");
        }
    });

    endpoint
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", cli.url))?;
    endpoint
        .wait_ready(Duration::from_secs(cli.ready_timeout))
        .await
        .context("Remote runtime did not answer the hello")?;
    info!(
        "{} connected to remote {}",
        endpoint.runtime_name(),
        endpoint.remote_id().unwrap_or_default()
    );

    match cli.command {
        Command::Watch => watch(&endpoint, registered_rx).await?,
        Command::Services {
            capability,
            wait_ms,
        } => {
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            let services = match capability.as_deref() {
                Some(capability) => endpoint.services_with_capability(capability),
                None => endpoint.services(),
            };
            for record in services {
                println!("{:<40} {}", record.full_name(), record.type_key);
            }
        }
        Command::Send {
            service,
            method,
            args,
        } => {
            endpoint.send_to(&service, &method, parse_args(&args))?;
        }
        Command::Call {
            service,
            method,
            args,
        } => {
            let reply = endpoint
                .send_to_blocking(&service, &method, parse_args(&args))
                .await
                .with_context(|| format!("Blocking call {}.{} failed", service, method))?;
            for index in 0..reply.arity() {
                let value = reply.arg_value(index).unwrap_or(Value::Null);
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
        }
    }

    endpoint.close().await?;
    Ok(())
}

/// Print every message of every registered service until interrupted.
async fn watch(
    endpoint: &Endpoint,
    mut registered: mpsc::UnboundedReceiver<(String, String)>,
) -> Result<()> {
    let printer = callback(|envelope| {
        let data = serde_json::to_string(&envelope.data)?;
        println!("{} {} {}", envelope.sender, envelope.method, data);
        Ok(())
    });
    endpoint.subscribe_released(|name| println!("- {}", name));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                return Ok(());
            }
            next = registered.recv() => {
                let Some((name, type_key)) = next else {
                    return Ok(());
                };
                println!("+ {} ({})", name, type_key);
                endpoint.subscribe_by_name(&name, printer.clone());
                for topic in [ProtocolConfig::PUBLISH_STATUS, ProtocolConfig::PUBLISH_STATE] {
                    endpoint.subscribe(&name, topic)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_args_json_and_strings() {
        let raw = vec![
            "90".to_string(),
            "{\"speed\":1.5}".to_string(),
            "hello world".to_string(),
            "true".to_string(),
        ];
        let args = parse_args(&raw);
        assert_eq!(args.len(), 4);

        let encoded = args.encode().unwrap().unwrap();
        assert_eq!(encoded[0], json!("90"));
        assert_eq!(encoded[1], json!("{\"speed\":1.5}"));
        assert_eq!(encoded[2], json!("\"hello world\""));
        assert_eq!(encoded[3], json!("true"));
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["mrl-cli", "services"]).unwrap();
        assert_eq!(cli.url, ProtocolConfig::DEFAULT_URL);
        assert_eq!(cli.blocking_interval_ms, 1000);
        assert_eq!(cli.blocking_retries, BlockingConfig::MAX_POLLS);
        assert!(matches!(
            cli.command,
            Command::Services {
                capability: None,
                wait_ms: 1500
            }
        ));
    }

    #[test]
    fn test_cli_call_arguments() {
        let cli = Cli::try_parse_from([
            "mrl-cli", "--id", "E1", "-d", "call", "servo1", "moveTo", "45",
        ])
        .unwrap();
        assert_eq!(cli.id.as_deref(), Some("E1"));
        assert!(cli.debug);
        match cli.command {
            Command::Call {
                service,
                method,
                args,
            } => {
                assert_eq!(service, "servo1");
                assert_eq!(method, "moveTo");
                assert_eq!(args, vec!["45".to_string()]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
