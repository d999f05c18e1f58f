use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use vantage_core::capture::PcapSource;
use vantage_core::config::AppConfig;
use vantage_core::error::exit_code;
use vantage_core::pipeline::Pipeline;
use vantage_core::ws::hub::WsHub;
use vantage_core::{api, db, retention};

/// vantage — passive network-traffic observatory for a mirror/span port.
#[derive(Parser, Debug)]
#[command(name = "vantaged", version, about)]
struct Cli {
    /// Capture interface name. Defaults to the configured/auto-detected interface.
    #[arg(short, long)]
    interface: Option<String>,

    /// Path to the SQLite database file.
    #[arg(long, default_value = "vantage.db")]
    db: String,

    /// Path to a TOML configuration file (optional).
    #[arg(short, long)]
    config: Option<String>,

    /// Address to bind the query/notification HTTP surface on. Disabled if omitted.
    #[arg(short, long)]
    listen: Option<String>,
}

const BANNER: &str = r#"
 __   __          _
 \ \ / /_ _ _ __ | |_ __ _  __ _  ___
  \ V / _` | '_ \| __/ _` |/ _` |/ _ \
   | | (_| | | | | || (_| | (_| |  __/
   |_|\__,_|_| |_|\__\__,_|\__, |\___|
                           |___/
"#;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vantage_core=info,tower_http=info".into()),
        )
        .init();

    if let Err(e) = run().await {
        error!("fatal: {e:#}");
        std::process::exit(exit_code_for(&e));
    }
}

fn exit_code_for(e: &anyhow::Error) -> i32 {
    if let Some(core_err) = e.downcast_ref::<vantage_core::error::CoreError>() {
        use vantage_core::error::CoreError;
        return match core_err {
            CoreError::ConfigInvalid { .. } => exit_code::CONFIG_INVALID,
            CoreError::InterfaceUnavailable(_) => exit_code::INTERFACE_UNAVAILABLE,
            CoreError::PersistenceFatal(_) => exit_code::PERSISTENCE_UNRECOVERABLE,
            _ => exit_code::CLEAN,
        };
    }
    exit_code::CONFIG_INVALID
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    println!("{BANNER}");
    info!(version = env!("CARGO_PKG_VERSION"), "starting vantage");

    let mut config = if let Some(ref path) = cli.config {
        AppConfig::from_file(path)?
    } else {
        AppConfig::default()
    };
    if cli.interface.is_some() {
        config.interface = cli.interface.clone();
    }
    if cli.listen.is_some() {
        config.listen = cli.listen.clone();
    }
    config.validate()?;

    let pool = db::init(&cli.db).await?;
    info!(path = %cli.db, "database initialized");

    let ws_hub = Arc::new(WsHub::new());
    let pipeline = Pipeline::new(&config, pool.clone(), ws_hub.clone());

    retention::start_retention_task(pool.clone(), config.retention.clone());

    let interface = config
        .interface
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no capture interface configured (pass --interface or set `interface` in the config file)"))?;
    let source = PcapSource::open(&interface, &config.bpf_filter)?;
    info!(interface = %interface, filter = %config.bpf_filter, "interface reader starting");

    let worker_count = std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1);

    // Reopens the interface if it vanishes at runtime (§7); the reader
    // thread drives this with an escalating backoff before giving up.
    let reconnect_interface = interface.clone();
    let reconnect_filter = config.bpf_filter.clone();
    let reconnect: vantage_core::capture::ReconnectFn = Box::new(move || {
        PcapSource::open(&reconnect_interface, &reconnect_filter)
            .map(|s| Box::new(s) as Box<dyn vantage_core::capture::PacketSource>)
    });
    let running = pipeline.spawn(Box::new(source), worker_count, Some(reconnect));
    let capture_health = running.capture_health_for_watch();

    let listen_result = if let Some(listen_addr) = config.listen.clone() {
        let state = api::AppState::new(pool, config, ws_hub, Some(running.handles()));
        let app = api::router(state);
        let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
        info!(addr = %listen_addr, "query surface listening");
        Some(tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
        }))
    } else {
        info!("query/notification surface disabled (no --listen address configured)");
        None
    };

    let interface_lost = async {
        loop {
            if capture_health
                .interface_unavailable
                .load(std::sync::atomic::Ordering::SeqCst)
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    };

    tokio::select! {
        ctrl_c = tokio::signal::ctrl_c() => {
            ctrl_c?;
            info!("shutdown signal received");
            running.shutdown().await;
            if let Some(handle) = listen_result {
                handle.abort();
            }
            Ok(())
        }
        _ = interface_lost => {
            error!(interface = %interface, "capture interface unavailable after exhausting reconnect attempts");
            running.shutdown().await;
            if let Some(handle) = listen_result {
                handle.abort();
            }
            Err(vantage_core::error::CoreError::InterfaceUnavailable(interface).into())
        }
    }
}
