//! Demo and self-check binary.
//!
//! ```text
//! async-secure-tcp serve   --port 7000 [--cert c.pem --key k.pem]
//! async-secure-tcp connect --host example.com --port 443 --secure [--ca ca.pem]
//! async-secure-tcp selftest
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use async_secure_tcp::config::{load_config, RuntimeConfig};
use async_secure_tcp::observability::{logging, metrics};
use async_secure_tcp::stack::loopback::LoopbackStack;
use async_secure_tcp::stack::socket::SocketStack;
use async_secure_tcp::{Connection, Context, Listener, ServerCredentials};

#[derive(Parser)]
#[command(name = "async-secure-tcp")]
#[command(about = "Event-driven TCP/TLS connections: demo server, client and self-check", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Echo server over real sockets
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: Ipv4Addr,
        #[arg(short, long, default_value_t = 7000)]
        port: u16,
        /// Certificate chain (PEM); enables TLS together with --key
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,
        /// Private key (PEM)
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
    },
    /// Send one message and print the reply
    Connect {
        #[arg(long)]
        host: String,
        #[arg(short, long)]
        port: u16,
        #[arg(short, long, default_value = "PING")]
        message: String,
        #[arg(long)]
        secure: bool,
        /// Root CA (PEM); without it any server certificate is accepted
        #[arg(long)]
        ca: Option<PathBuf>,
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// In-process PING/PONG over the loopback stack
    Selftest,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RuntimeConfig::default(),
    };
    logging::init_logging(&config.observability);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "async-secure-tcp starting");

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    match cli.command {
        Commands::Serve { bind, port, cert, key } => serve(config, SocketAddrV4::new(bind, port), cert, key).await,
        Commands::Connect {
            host,
            port,
            message,
            secure,
            ca,
            timeout_secs,
        } => {
            let request = Request {
                host,
                port,
                message,
                secure,
                ca,
                timeout: Duration::from_secs(timeout_secs),
            };
            connect(config, request).await
        }
        Commands::Selftest => selftest(config).await,
    }
}

async fn serve(
    config: RuntimeConfig,
    addr: SocketAddrV4,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::new(SocketStack::new()?, config);
    let listener = Listener::new(&ctx, addr);

    listener.on_client(|conn| {
        tracing::info!(peer = %conn.remote_ip(), port = conn.remote_port(), "Client accepted");
        conn.on_data(|c, data| {
            if c.write(data) == 0 {
                tracing::warn!(len = data.len(), "Echo did not fit the send window");
            }
        });
        conn.on_disconnect(|c| tracing::info!(peer = %c.remote_ip(), "Client left"));
    });

    match (cert, key) {
        (Some(cert), Some(key)) => {
            let credentials = ServerCredentials::new(std::fs::read(cert)?, std::fs::read(key)?);
            listener.begin_secure(&credentials)?;
        }
        _ => listener.begin()?,
    }
    tracing::info!(address = %addr, port = listener.local_port(), "Echo server running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    listener.end();
    tracing::info!("Shutdown complete");
    Ok(())
}

struct Request {
    host: String,
    port: u16,
    message: String,
    secure: bool,
    ca: Option<PathBuf>,
    timeout: Duration,
}

enum Outcome {
    Reply(Vec<u8>),
    Failed(String),
    Closed,
}

async fn connect(config: RuntimeConfig, request: Request) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::new(SocketStack::new()?, config);
    let conn = Connection::new(&ctx);
    if let Some(ca) = &request.ca {
        conn.set_root_ca(std::fs::read(ca)?);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let message = request.message.clone().into_bytes();
    conn.on_connect(move |c| {
        if c.write(&message) == 0 {
            tracing::warn!("Message did not fit the send window");
        }
    });
    let on_data = tx.clone();
    conn.on_data(move |c, data| {
        let _ = on_data.send(Outcome::Reply(data.to_vec()));
        c.close(false);
    });
    let on_error = tx.clone();
    conn.on_error(move |_, err| {
        let _ = on_error.send(Outcome::Failed(err.to_string()));
    });
    conn.on_disconnect(move |_| {
        let _ = tx.send(Outcome::Closed);
    });

    conn.connect_host(&request.host, request.port, request.secure)?;

    match tokio::time::timeout(request.timeout, rx.recv()).await {
        Ok(Some(Outcome::Reply(reply))) => println!("{}", String::from_utf8_lossy(&reply)),
        Ok(Some(Outcome::Failed(reason))) => return Err(reason.into()),
        Ok(Some(Outcome::Closed)) | Ok(None) => return Err("connection closed before a reply".into()),
        Err(_) => {
            conn.close(true);
            return Err("timed out waiting for a reply".into());
        }
    }
    Ok(())
}

async fn selftest(config: RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let stack = LoopbackStack::new();
    stack.spawn_poller(Duration::from_millis(500));
    let ctx = Context::new(stack, config);
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7);

    let listener = Listener::new(&ctx, addr);
    listener.on_client(|conn| {
        conn.on_data(|c, data| {
            if data == b"PING" {
                c.write(b"PONG");
            }
        });
    });
    listener.begin()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Connection::new(&ctx);
    client.on_connect(|c| {
        c.write(b"PING");
    });
    client.on_data(move |c, data| {
        let _ = tx.send(data.to_vec());
        c.close(false);
    });
    client.connect(addr, false)?;

    let result = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
    listener.end();
    match result {
        Ok(Some(reply)) if reply == b"PONG" => {
            println!("selftest passed");
            Ok(())
        }
        Ok(other) => Err(format!("unexpected reply: {:?}", other).into()),
        Err(_) => Err("selftest timed out".into()),
    }
}
