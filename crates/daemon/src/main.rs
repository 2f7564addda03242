use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crypto_box::aead::OsRng;
use ed25519_dalek::SigningKey;
use log::{debug, info, warn};
use nextpath::{
    config::{self, encode_key},
    Address, ClientConfig, ClientNotify, ClientWorker, Metrics, ServerConfig, ServerNotify,
    ServerWorker, SessionUpdateResponse, StaticBackend, Transport, UdpTransport,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tokio::time::{interval, Duration};

#[derive(Parser, Debug)]
#[command(
    name = "nextpath",
    version,
    about = "nextpath - accelerated UDP sessions for game traffic",
    long_about = "nextpath daemon\n\n\
        Runs either half of the acceleration protocol:\n\
        - server: upgrades clients and echoes their payloads\n\
        - client: opens a session and sends a payload every second\n\n\
        Examples:\n  \
          # Generate keys for a config file\n  \
          nextpath keygen\n\n  \
          # Run a server\n  \
          nextpath --config server.toml server --bind 0.0.0.0:40000\n\n  \
          # Connect a client\n  \
          nextpath --config client.toml client --server 5.6.7.8:40000"
)]
struct Args {
    /// Path to config file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh set of keys as a [security] config section
    Keygen,
    /// Run a game server endpoint
    Server {
        /// Local bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
        /// Address clients reach this server at (overrides config)
        #[arg(short, long)]
        public: Option<String>,
    },
    /// Run a client against a server
    Client {
        /// Server address (overrides config)
        #[arg(short, long)]
        server: Option<String>,
        /// Local bind address
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: String,
    },
}

fn load_config(args: &Args) -> config::Config {
    if let Some(path) = &args.config {
        config::Config::load(path).unwrap_or_else(|e| {
            warn!(
                "Failed to load config from {:?}: {}. Using defaults.",
                path, e
            );
            config::Config::default()
        })
    } else {
        config::Config::load_or_default()
    }
}

fn keygen() {
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let route_secret = crypto_box::SecretKey::generate(&mut OsRng);
    let backend_secret = crypto_box::SecretKey::generate(&mut OsRng);

    println!("[security]");
    println!("customer_private_key = \"{}\"", encode_key(&signing_key.to_bytes()));
    println!(
        "customer_public_key = \"{}\"",
        encode_key(&signing_key.verifying_key().to_bytes())
    );
    println!("server_route_private_key = \"{}\"", encode_key(&route_secret.to_bytes()));
    println!(
        "backend_public_key = \"{}\"",
        encode_key(backend_secret.public_key().as_bytes())
    );
    println!();
    println!("# Server route public key, for the control plane:");
    println!("#   {}", encode_key(route_secret.public_key().as_bytes()));
    println!("# Backend private key, for the control plane:");
    println!("#   {}", encode_key(&backend_secret.to_bytes()));
}

async fn run_server(
    config: &config::Config,
    bind: Option<String>,
    public: Option<String>,
) -> Result<()> {
    let bind_address = match bind {
        Some(bind) => bind.parse::<SocketAddr>().context("Invalid --bind address")?,
        None => config.network.bind_address()?,
    };
    let public_address: Option<Address> = match public {
        Some(public) => Some(public.parse::<Address>().context("Invalid --public address")?),
        None => config.network.public_address()?,
    };

    let transport = UdpTransport::bind(bind_address).await?;
    let server_address = public_address.unwrap_or_else(|| transport.local_address());

    let mut server_config = ServerConfig::new(
        server_address,
        config.security.signing_key()?,
        config.security.route_secret()?,
        config.security.backend_public_key()?,
    );
    server_config.backend_update_interval = config.timing.backend_update_interval().as_secs_f64();

    // Without a control plane every session stays direct.
    let backend = StaticBackend::with_default(SessionUpdateResponse::direct());
    let metrics = Metrics::new();
    let server = ServerWorker::spawn(
        server_config,
        Box::new(backend),
        transport,
        metrics.clone(),
        config.timing.tick_interval(),
    );

    info!("🚀 Server listening on {} as {}", server.local_address(), server_address);

    let mut poll_interval = interval(config.timing.tick_interval());
    let mut status_interval = interval(config.timing.status_interval());
    let mut upgraded: HashSet<Address> = HashSet::new();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutting down server...");
                break;
            }
            _ = status_interval.tick() => {
                info!("📊 {}", metrics.summary());
            }
            _ = poll_interval.tick() => {
                while let Some(notification) = server.try_recv() {
                    match notification {
                        ServerNotify::PacketReceived { address, payload } => {
                            debug!("{} bytes from {}", payload.len(), address);
                            if upgraded.insert(address) {
                                server.upgrade_session(address, 0);
                            }
                            server.send_packet(address, &payload);
                        }
                        ServerNotify::SessionUpgraded { address, session_id, .. } => {
                            info!("✅ Upgraded {} as session {:016x}", address, session_id);
                        }
                        ServerNotify::PendingSessionTimedOut { address, session_id } => {
                            warn!("Upgrade of {} ({:016x}) timed out", address, session_id);
                            upgraded.remove(&address);
                        }
                        ServerNotify::SessionTimedOut { address, session_id } => {
                            info!("Session {:016x} at {} timed out", session_id, address);
                            upgraded.remove(&address);
                        }
                        ServerNotify::Ready => info!("Server ready"),
                    }
                }
            }
        }
    }

    server.shutdown().await;
    info!("📊 {}", metrics.summary());
    Ok(())
}

async fn run_client(config: &config::Config, server: Option<String>, bind: String) -> Result<()> {
    let server_address: Address = match server {
        Some(server) => server.parse::<Address>().context("Invalid --server address")?,
        None => config
            .network
            .server_address()?
            .context("No server address: pass --server or set network.server_address")?,
    };

    let client_config = ClientConfig {
        customer_public_key: config.security.verifying_key()?,
        backend_public_key: config.security.backend_public_key()?,
        platform_id: config.daemon.platform_id,
        connection_type: config.daemon.connection_type,
    };

    let transport = UdpTransport::bind(bind.parse::<SocketAddr>().context("Invalid --bind address")?).await?;
    let metrics = Metrics::new();
    let client = ClientWorker::spawn(
        client_config,
        transport,
        metrics.clone(),
        config.timing.tick_interval(),
    );
    client.open_session(server_address);
    info!("🚀 Client on {} connecting to {}", client.local_address(), server_address);

    let mut poll_interval = interval(config.timing.tick_interval());
    let mut send_interval = interval(Duration::from_secs(1));
    let mut status_interval = interval(config.timing.status_interval());
    let mut counter: u64 = 0;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutting down client...");
                break;
            }
            _ = status_interval.tick() => {
                info!("📊 {}", metrics.summary());
            }
            _ = send_interval.tick() => {
                counter += 1;
                client.send_packet(format!("hello {}", counter).as_bytes());
            }
            _ = poll_interval.tick() => {
                while let Some(notification) = client.try_recv() {
                    match notification {
                        ClientNotify::PacketReceived(payload) => {
                            debug!("Received {:?}", String::from_utf8_lossy(&payload));
                        }
                        ClientNotify::Upgraded { session_id } => {
                            info!("✅ Upgraded to session {:016x}", session_id);
                        }
                        ClientNotify::StatsUpdated(stats) => {
                            debug!(
                                "rtt direct={:.1}ms next={:.1}ms next={}",
                                stats.direct_rtt, stats.next_rtt, stats.next
                            );
                        }
                        ClientNotify::Ready => info!("Client ready"),
                    }
                }
            }
        }
    }

    client.shutdown().await;
    info!("📊 {}", metrics.summary());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args);

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.daemon.log_level))
        .init();

    match args.command {
        Command::Keygen => {
            keygen();
            Ok(())
        }
        Command::Server { bind, public } => run_server(&config, bind, public).await,
        Command::Client { server, bind } => run_client(&config, server, bind).await,
    }
}
