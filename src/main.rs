pub mod block;
pub mod block_pool;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod identity;
pub mod multiverse;
pub mod network;
pub mod network_type;
pub mod peer_manager;
pub mod shutdown;
pub mod store;
pub mod worker;

use clap::Parser;
use config::Config;
use engine::Engine;
use network::server::{run_dial_loop, NetworkServer};
use network_type::NetworkType;
use shutdown::ShutdownManager;

#[derive(Parser, Debug)]
#[command(name = "latticed")]
#[command(about = "Lattice multi-chain anchoring node", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(long)]
    listen_addr: Option<String>,

    /// Identity credited in mined blocks
    #[arg(long)]
    miner_key: Option<String>,

    /// Cap on mining worker processes
    #[arg(long)]
    max_workers: Option<usize>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,

    /// Internal: run as a mining worker child process
    #[arg(long, hide = true)]
    mine_worker: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Worker mode: no banner, no config, just the stdio channel and the
    // search loop. The supervisor is the other end of stdin/stdout.
    if args.mine_worker {
        let code = worker::miner::run().await;
        std::process::exit(code);
    }

    // Print hostname at startup BEFORE any logging
    if let Ok(hostname) = hostname::get() {
        if let Ok(hostname_str) = hostname.into_string() {
            let short_name = hostname_str.split('.').next().unwrap_or(&hostname_str);
            eprintln!("latticed starting on {short_name}");
        }
    }

    // Determine network type from config file or default to testnet
    let network_type = if let Ok(cfg) = Config::load_from_file(&args.config) {
        cfg.node.network_type()
    } else {
        NetworkType::Testnet
    };

    if args.generate_config {
        let config = Config::default();
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("Failed to generate config: {e}");
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&args.config, &network_type) {
        Ok(cfg) => {
            println!("Loaded configuration from {}", args.config);
            cfg
        }
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    // CLI overrides
    if let Some(listen_addr) = args.listen_addr {
        config.network.listen_address = listen_addr;
    }
    if args.miner_key.is_some() {
        config.mining.miner_key = args.miner_key;
    }
    if args.max_workers.is_some() {
        config.mining.max_workers = args.max_workers;
    }

    let _log_guard = setup_logging(&config.logging, args.verbose);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_HASH"),
        built = env!("BUILD_DATE"),
        network = network_type.name(),
        data_dir = %config.storage.data_dir,
        workers = config.mining.effective_workers(),
        quorum = config.network.effective_quorum(&network_type),
        "node configuration loaded"
    );

    let mut shutdown = ShutdownManager::new();
    let cancel = shutdown.token();

    let engine = match Engine::new(config.clone(), cancel.clone()) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("failed to initialize node: {e}");
            std::process::exit(1);
        }
    };
    let ctx = engine.protocol_context();
    let registry = engine.registry();

    let listen = config.network.full_listen_address(&network_type);
    let server =
        match NetworkServer::bind(&listen, ctx.clone(), registry.clone(), cancel.clone()).await {
            Ok(server) => server,
            Err(e) => {
                tracing::error!("failed to bind {listen}: {e}");
                std::process::exit(1);
            }
        };

    shutdown.register_task(tokio::spawn(server.run()));
    shutdown.register_task(tokio::spawn(run_dial_loop(ctx, registry, cancel.clone())));
    shutdown.register_task(tokio::spawn(async move {
        if let Err(e) = engine.run().await {
            // pool-init failure or a lost tip write; nothing to salvage
            tracing::error!("engine failed: {e}");
            std::process::exit(1);
        }
    }));

    shutdown.wait_for_shutdown().await;
}

fn setup_logging(
    config: &config::LoggingConfig,
    verbose: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .compact();

    if config.file_path.is_empty() {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let path = std::path::Path::new(&config.file_path);
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "node.log".to_string());
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("Cannot create log directory {}: {e}", dir.display());
    }
    let appender = tracing_appender::rolling::daily(dir, file);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer().with_ansi(false).with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    Some(guard)
}
