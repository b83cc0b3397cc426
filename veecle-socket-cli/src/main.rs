//! `veecle-socket` CLI
//!
//! Runs an echo server or sends a one-shot request over any transport supported by
//! `veecle-socket`.

#![forbid(unsafe_code)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use veecle_socket::{
    Client, ClientConfig, ConnState, Error, MultiSocketAddress, Network, Server, ServerConfig,
    ServerConnection,
};

/// Socket client and server over TCP, UDP and Unix domain sockets.
#[derive(Parser, Debug)]
#[command(disable_help_subcommand = true, version)]
struct Arguments {
    /// TOML file with `[client]` and/or `[server]` tables.
    #[arg(long, env = "VEECLE_SOCKET_CONFIG", global = true)]
    config: Option<Utf8PathBuf>,

    /// Transport, overriding the configuration file.
    #[arg(long, global = true)]
    network: Option<Network>,

    /// `host:port` or socket path, overriding the configuration file.
    #[arg(long, global = true)]
    address: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Serve an echo handler until SIGINT or SIGTERM.
    Serve {
        /// How long to wait for open connections to drain on shutdown, in seconds.
        #[arg(long, default_value_t = 5.0)]
        drain: f64,
    },

    /// Send one request and print the response.
    Send {
        /// Request payload; read from stdin when omitted.
        #[arg(long)]
        message: Option<String>,

        /// How long to wait for response bytes, in seconds. `0` skips reading a response.
        #[arg(long, default_value_t = 1.0)]
        wait: f64,
    },
}

/// Layout of the configuration file.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct File {
    client: Option<ClientConfig>,
    server: Option<ServerConfig>,
}

impl File {
    fn load(path: Option<&Utf8Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        toml::from_str(&contents).with_context(|| format!("parsing {path}"))
    }
}

impl Arguments {
    fn client_config(&self, file: File) -> anyhow::Result<ClientConfig> {
        let config = file.client;
        let network = self
            .network
            .or(config.as_ref().map(|config| config.network))
            .context("no network given for the client")?;
        let address = self
            .address
            .clone()
            .or(config.map(|config| config.address))
            .context("no address given for the client")?;
        Ok(ClientConfig::new(network, address))
    }

    fn server_config(&self, file: File) -> anyhow::Result<ServerConfig> {
        let mut config = file.server.unwrap_or_default();
        if let Some(network) = self.network {
            config.network = network;
        }
        if let Some(address) = &self.address {
            config.address.clone_from(address);
        }
        anyhow::ensure!(!config.address.is_empty(), "no address given for the server");
        Ok(config)
    }
}

fn seconds(value: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid duration {value}"))
}

async fn echo(connection: ServerConnection) {
    let mut buffer = vec![0; veecle_socket::MAX_DATAGRAM_SIZE];
    loop {
        match connection.read(&mut buffer).await {
            Ok(0) => break,
            Ok(length) => {
                if let Err(error) = connection.write_all(&buffer[..length]).await {
                    tracing::debug!(%error, "echo write failed");
                    break;
                }
            }
            Err(error) => {
                tracing::debug!(%error, "echo read failed");
                break;
            }
        }
    }
}

#[tracing::instrument(skip_all, fields(network = %config.network, address = %config.address))]
async fn serve(config: ServerConfig, drain: Duration) -> anyhow::Result<()> {
    let server = Server::new(config, echo).await.context("binding server")?;
    server.register_func_error(Some(std::sync::Arc::new(|error: Error| {
        tracing::warn!(%error, "server error");
    })));
    server.register_func_info(Some(std::sync::Arc::new(
        |local: MultiSocketAddress, remote: MultiSocketAddress, state: ConnState| {
            tracing::debug!(%local, %remote, %state);
        },
    )));
    server.register_func_info_server(Some(std::sync::Arc::new(|message: String| {
        tracing::info!("{message}");
    })));

    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = server.done() => {}
    }

    if let Err(error) = server.shutdown_and_wait(drain).await {
        tracing::warn!(%error, "connections still open at exit");
    }
    serving.await?.context("serving")?;
    Ok(())
}

#[tracing::instrument(skip_all, fields(network = %config.network, address = %config.address))]
async fn send(config: ClientConfig, message: Option<String>, wait: Duration) -> anyhow::Result<()> {
    let client = Client::new(config).context("creating client")?;
    if !wait.is_zero() {
        client.set_read_timeout(Some(wait));
    }

    let (sender, receiver) = tokio::sync::oneshot::channel();
    let response = move |client: Client| async move {
        let mut output = Vec::new();
        let mut buffer = vec![0; veecle_socket::DEFAULT_BUFFER_SIZE];
        loop {
            match client.read(&mut buffer).await {
                Ok(0) | Err(Error::TimedOut(_)) => break,
                Ok(length) => {
                    output.extend_from_slice(&buffer[..length]);
                    if !client.network().is_stream() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "reading response failed");
                    break;
                }
            }
        }
        let _ = sender.send(output);
    };
    let response = (!wait.is_zero()).then_some(response);

    let cancel = CancellationToken::new();
    match message {
        Some(message) => client.once(&cancel, Some(message.as_bytes()), response).await?,
        None => client.once(&cancel, Some(tokio::io::stdin()), response).await?,
    }

    if let Ok(output) = receiver.await {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(&output).await?;
        stdout.flush().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Arguments::parse();

    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .with_env_var("VEECLE_SOCKET_LOG")
                    .from_env()?,
            )
            .with_writer(std::io::stderr)
            .compact()
            .finish(),
    )?;

    let file = File::load(args.config.as_deref())?;
    match &args.command {
        Command::Serve { drain } => serve(args.server_config(file)?, seconds(*drain)?).await,
        Command::Send { message, wait } => {
            send(args.client_config(file)?, message.clone(), seconds(*wait)?).await
        }
    }
}
