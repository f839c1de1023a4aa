//! `switchboard` command-line tool: declare topology, make calls, and run an
//! echo service against a broker.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use switchboard_core::{ReplyBody, RoutingKey};
use switchboard_rpc::config::ServiceConfig;
use switchboard_rpc::logging::{self, LogFormat};
use switchboard_rpc::worker::HandlerRouter;
use switchboard_rpc::MessagingModule;
use tracing::info;

#[derive(Parser)]
#[command(name = "switchboard", version, about = "Request/reply messaging over AMQP")]
struct Cli {
    /// Service configuration file (TOML).
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `broker.url` from the configuration file.
    #[arg(long, global = true, env = "SWITCHBOARD_BROKER_URL")]
    broker_url: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Declares the configured topology and exits.
    Topology,
    /// Sends a request and prints the reply.
    Call {
        routing_key: String,
        /// JSON request body.
        #[arg(default_value = "{}")]
        payload: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Publishes a fire-and-forget message.
    Notify {
        routing_key: String,
        #[arg(default_value = "{}")]
        payload: String,
    },
    /// Answers every literal routing key bound by the topology with the
    /// request body, until interrupted.
    Echo,
}

fn load_config(cli: &Cli) -> anyhow::Result<ServiceConfig> {
    let mut config = match &cli.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(url) = &cli.broker_url {
        config.broker.url.clone_from(url);
    }
    config.validate()?;
    Ok(config)
}

fn json_payload(payload: &str) -> anyhow::Result<Bytes> {
    let value: serde_json::Value =
        serde_json::from_str(payload).context("payload is not valid JSON")?;
    Ok(Bytes::from(serde_json::to_vec(&value)?))
}

fn echo_router(config: &ServiceConfig) -> anyhow::Result<HandlerRouter> {
    let topology = config
        .topology
        .as_ref()
        .context("echo needs a [topology] section")?;
    let mut router = HandlerRouter::new();
    for key in topology
        .bindings
        .iter()
        .filter(|k| !k.as_str().contains(['*', '#']))
    {
        router.register_fn(key.clone(), |payload: Bytes| async move { Ok(payload) });
    }
    anyhow::ensure!(
        !router.is_empty(),
        "topology binds no literal routing keys to echo"
    );
    Ok(router)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format)?;
    let config = load_config(&cli)?;

    match cli.command {
        Command::Topology => {
            let mut module = MessagingModule::new(config);
            module.start().await?;
            info!("topology declared");
            module.shutdown().await?;
        }
        Command::Call {
            routing_key,
            payload,
            timeout_ms,
        } => {
            let routing_key = RoutingKey::new(routing_key)?;
            let payload = json_payload(&payload)?;
            let mut module = MessagingModule::new(config);
            module.start().await?;
            let client = module.client().context("client not started")?;
            let timeout = timeout_ms.map_or(client.default_timeout(), Duration::from_millis);
            let reply = client.call(&routing_key, payload, timeout).await;
            drop(client);
            module.shutdown().await?;
            let reply = reply?;
            match ReplyBody::from_slice(&reply) {
                Ok(body) => println!("{}", serde_json::to_string_pretty(&body)?),
                Err(_) => println!("{}", String::from_utf8_lossy(&reply)),
            }
        }
        Command::Notify {
            routing_key,
            payload,
        } => {
            let routing_key = RoutingKey::new(routing_key)?;
            let payload = json_payload(&payload)?;
            let mut module = MessagingModule::new(config);
            module.start().await?;
            let client = module.client().context("client not started")?;
            let sent = client.notify(&routing_key, payload).await;
            drop(client);
            module.shutdown().await?;
            sent?;
        }
        Command::Echo => {
            let router = echo_router(&config)?;
            let keys = router.routing_keys();
            let mut module = MessagingModule::new(config);
            module.start().await?;
            info!(keys = ?keys, "echo service running; press ctrl-c to stop");
            module
                .serve(router, async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
    }
    Ok(())
}
