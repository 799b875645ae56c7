use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vpn_guard::config::{self, Config};
use vpn_guard::connection::session::ConnectionParams;
use vpn_guard::connection::transport::WgQuickTransport;
use vpn_guard::dns::resolv::ResolvFile;
use vpn_guard::platform::{get_route_monitor, get_route_table};
use vpn_guard::splittun::{ConfigAddresses, SplitTunnelManager, get_backend};
use vpn_guard::{Connection, Detector, DnsManager};

#[derive(Parser)]
#[command(name = "vpn-guard")]
#[command(about = "VPN control plane: DNS override, leak detection and split tunneling")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the configured session and guard it until interrupted
    Run,
    /// Restore the DNS configuration left behind by a previous run
    RestoreDns,
    /// List processes excluded from the tunnel
    Apps {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a command outside the tunnel
    ///
    /// Usage: sudo vpn-guard exclude -- firefox
    Exclude {
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Generate default config file
    Init {
        /// Where to write the file
        #[arg(short, long, default_value = config::CONFIG_FILE_NAME)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging, RUST_LOG takes precedence over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run => {
            let config = config::load_config(cli.config.as_deref())?;
            if let Err(e) = run(config).await {
                error!("{}", e);
                std::process::exit(1);
            }
        }
        Commands::RestoreDns => {
            let config = config::load_config(cli.config.as_deref())?;
            let dns = DnsManager::new(resolv_file(&config));
            dns.recover().await?;
            println!("DNS configuration is in its OS-defined state");
        }
        Commands::Apps { json } => {
            let split = SplitTunnelManager::new(get_backend());
            split.initialize()?;
            let apps = split.list_running_apps()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&apps)?);
            } else if apps.is_empty() {
                println!("No processes excluded from the tunnel");
            } else {
                println!("{:>8} {:>8}  {}", "PID", "PPID", "COMMAND");
                for app in &apps {
                    let command = if app.cmdline.is_empty() { &app.exe } else { &app.cmdline };
                    println!("{:>8} {:>8}  {}", app.pid, app.ppid, command);
                }
            }
        }
        Commands::Exclude { command } => {
            let split = SplitTunnelManager::new(get_backend());
            split.initialize()?;
            split.add_process(std::process::id() as i32, &command.join(" "))?;

            // The child inherits the cgroup of this process
            let status = std::process::Command::new(&command[0])
                .args(&command[1..])
                .status()?;
            std::process::exit(status.code().unwrap_or(1));
        }
        Commands::Init { output } => {
            info!("Generating default config...");
            Config::default().save(&output)?;
            println!("Created default config: {}", output.display());
        }
    }

    Ok(())
}

fn resolv_file(config: &Config) -> ResolvFile {
    ResolvFile::new(&config.dns.resolv_path, &config.dns.backup_path)
}

/// Tunnel addresses plus the configured public addresses
fn split_tunnel_addresses(config: &Config, params: &ConnectionParams) -> ConfigAddresses {
    let (ipv4_tunnel, ipv6_tunnel) = match params.client_tunnel_ip {
        IpAddr::V4(addr) => (Some(addr), None),
        IpAddr::V6(addr) => (None, Some(addr)),
    };
    ConfigAddresses {
        ipv4_public: config.split_tunnel.public_ipv4,
        ipv4_tunnel,
        ipv6_public: config.split_tunnel.public_ipv6,
        ipv6_tunnel,
    }
}

fn apply_split_tunnel(split: &SplitTunnelManager, config: &Config, params: &ConnectionParams, vpn_enabled: bool) {
    let result = split.apply_config(
        config.split_tunnel.enabled,
        vpn_enabled,
        split_tunnel_addresses(config, params),
        config.split_tunnel.apps.clone(),
    );
    if let Err(e) = result {
        warn!("Failed to apply split tunnel configuration: {}", e);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let params = config
        .session
        .clone()
        .ok_or("No [session] section in the configuration")?;

    let dns = Arc::new(DnsManager::with_settle_period(
        resolv_file(&config),
        config.dns.settle_period(),
    ));
    dns.recover().await?;

    let split = SplitTunnelManager::new(get_backend());
    let split_available = match split.initialize() {
        Ok(()) => true,
        Err(e) => {
            warn!("Continuing without split tunneling: {}", e);
            false
        }
    };

    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(state) = state_rx.recv().await {
            info!("Connection state: {:?}", state);
        }
    });

    let connection = Connection::new(
        Arc::clone(&dns),
        Box::new(WgQuickTransport::new(&config.transport.binary)),
        config.transport.session_path(),
        state_tx,
    );
    connection.connect(params.clone()).await?;

    if split_available {
        apply_split_tunnel(&split, &config, &params, true);
    }

    let (event_tx, mut event_rx) = mpsc::channel(config.detector.channel_capacity());
    let detector = match start_detector(&config, event_tx) {
        Ok(detector) => Some(detector),
        Err(e) => {
            warn!("Leak detection unavailable: {}", e);
            None
        }
    };

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            Some(event) = event_rx.recv() => {
                if event.is_interface_leak() {
                    warn!(
                        "Traffic leak: default route no longer uses {} (gateway: {})",
                        config.transport.interface,
                        event
                            .new_default_gateway()
                            .map(|gw| gw.to_string())
                            .unwrap_or_else(|| "unknown".to_string())
                    );
                } else {
                    info!("Routing changed, tunnel still carries the default route");
                }
            }
        }
    }

    // Teardown changes routes too; those are not leaks
    if let Some(detector) = &detector {
        detector.uninit();
    }

    let result = connection.disconnect().await;

    if split_available {
        apply_split_tunnel(&split, &config, &params, false);
    }

    result?;
    Ok(())
}

fn start_detector(
    config: &Config,
    event_tx: mpsc::Sender<vpn_guard::RouteChangeEvent>,
) -> Result<Detector, Box<dyn std::error::Error>> {
    let detector = Detector::with_delay(
        get_route_table()?,
        get_route_monitor()?,
        config.detector.debounce(),
    );
    detector.init(event_tx, Some(config.transport.interface.clone()));
    detector.start()?;
    Ok(detector)
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
