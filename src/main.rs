use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use zaguan::config::{create_example_cluster_conf, load_cluster_conf, Config};
use zaguan::Proxy;

#[derive(Parser)]
#[command(name = "zaguan")]
#[command(about = "A multi-tenant caching proxy for Memcache and Redis backends")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Run {
        /// Path to the process configuration file
        #[arg(short, long, default_value = "config/zaguan.toml")]
        config: PathBuf,
        /// Path to the cluster configuration file (polled for changes)
        #[arg(short = 'l', long, default_value = "config/clusters.toml")]
        clusters: PathBuf,
    },
    /// Generate example configuration files
    Config {
        /// Cluster flavor for the example (memcache or redis)
        #[arg(short, long)]
        mode: String,
        /// Output path for the cluster configuration file
        #[arg(short, long)]
        output: PathBuf,
        /// Also write a default process configuration here
        #[arg(short, long)]
        proxy_output: Option<PathBuf>,
    },
    /// Validate configuration files
    Validate {
        /// Path to the process configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// Path to the cluster configuration file
        #[arg(short = 'l', long)]
        clusters: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, clusters } => {
            run_proxy(config, clusters).await?;
        }
        Commands::Config {
            mode,
            output,
            proxy_output,
        } => {
            generate_config(mode, output, proxy_output)?;
        }
        Commands::Validate { config, clusters } => {
            validate_config(config, clusters)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

async fn run_proxy(
    config_path: PathBuf,
    clusters_path: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_from_file(&config_path)
        .map_err(|e| format!("failed to load config from {config_path:?}: {e}"))?;

    init_logging(&config);

    info!("starting zaguan v{}", env!("CARGO_PKG_VERSION"));
    info!("process configuration loaded from {config_path:?}");

    let cluster_confs = load_cluster_conf(&clusters_path)
        .map_err(|e| format!("failed to load cluster conf from {clusters_path:?}: {e}"))?;
    info!(
        "{} cluster(s) configured in {clusters_path:?}",
        cluster_confs.len()
    );

    let proxy = Arc::new(Proxy::new(config, &clusters_path)?);
    proxy.serve(cluster_confs).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    proxy.close().await;

    Ok(())
}

fn generate_config(
    mode: String,
    output: PathBuf,
    proxy_output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Generating {mode} cluster configuration file: {output:?}");
    create_example_cluster_conf(&output, &mode)
        .map_err(|e| format!("failed to generate cluster config: {e}"))?;

    if let Some(proxy_output) = proxy_output {
        println!("Generating process configuration file: {proxy_output:?}");
        Config::default()
            .save_to_file(&proxy_output)
            .map_err(|e| format!("failed to generate process config: {e}"))?;
    }

    println!("Configuration generated. Edit it to match your environment and run:");
    println!("  zaguan run --config zaguan.toml --clusters {output:?}");

    Ok(())
}

fn validate_config(
    config_path: PathBuf,
    clusters_path: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating {config_path:?}");
    let config = Config::load_from_file(&config_path)?;
    println!("✓ process configuration is valid");
    println!("  max connections: {}", config.proxy.max_connections);
    println!(
        "  cluster conf poll interval: {}ms",
        config.proxy.monitor_interval_ms
    );

    println!("Validating {clusters_path:?}");
    let clusters = load_cluster_conf(&clusters_path)?;
    println!("✓ cluster configuration is valid, {} cluster(s)", clusters.len());
    for cluster in &clusters {
        println!(
            "  {}: {:?} on {} -> {} server(s)",
            cluster.name,
            cluster.cache_type,
            cluster.listen_addr,
            cluster.servers.len()
        );
    }

    Ok(())
}

fn show_version() {
    println!("zaguan v{}", env!("CARGO_PKG_VERSION"));
    println!("A multi-tenant caching proxy for Memcache and Redis backends");
    println!();
    println!("Features:");
    println!("  • One process, many listeners, one cluster per listener");
    println!("  • Memcache text/binary, Redis and Redis Cluster dialects");
    println!("  • Live cluster reload with hot forwarder swap");
    println!("  • Ketama and modula key placement with backend auto-eject");
}

fn init_logging(config: &Config) {
    let log_level = match config.logging.level.as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    info!("logging initialized at level {log_level:?}");
}
