use colored::Colorize;

use bookstream::cli::{Cli, Commands, ConfigAction};
use bookstream::collector::Collector;
use bookstream::config::Config;
use bookstream::init_logging;

/// Exit codes: 0 healthy, 1 configuration error, 2 unrecoverable runtime
/// failure.
#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        Commands::Run => run_collector(&cli).await,
        Commands::Check => check_config(&cli.config_file),
        Commands::Config { ref action } => handle_config(action, &cli.config_file),
    }
}

async fn run_collector(cli: &Cli) -> i32 {
    let config = match Config::load_from_file(&cli.config_file) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {:#}", err);
            return 1;
        }
    };

    let level = cli.effective_log_level(&config.log.level);
    let _log_guard = match init_logging(&level, config.log.file_path.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialize logging: {:#}", err);
            return 1;
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config_file,
        "bookstream starting"
    );

    let mut collector = match Collector::start(config).await {
        Ok(collector) => collector,
        Err(err) => {
            tracing::error!(error = format!("{:#}", err), "startup failed");
            return 2;
        }
    };

    let outcome = collector.run_until_shutdown().await;
    let stats = collector.stop().await;
    for venue in &stats.venues {
        let synced = venue.symbols.iter().filter(|s| s.is_synced).count();
        tracing::info!(
            exchange = %venue.exchange,
            synced,
            total = venue.symbols.len(),
            "final venue state"
        );
    }

    match outcome {
        Ok(()) => 0,
        Err(_) => 2,
    }
}

fn check_config(config_file: &str) -> i32 {
    match Config::load_from_file(config_file) {
        Ok(config) => {
            let symbols: usize = config.collectors.iter().map(|c| c.symbols.len()).sum();
            println!(
                "{} {} ({} collectors, {} symbols)",
                "valid:".green().bold(),
                config_file,
                config.collectors.len(),
                symbols
            );
            0
        }
        Err(err) => {
            eprintln!("{} {:#}", "invalid:".red().bold(), err);
            1
        }
    }
}

fn handle_config(action: &Option<ConfigAction>, config_file: &str) -> i32 {
    match action {
        Some(ConfigAction::Show) => {
            let config = Config::load_or_default(config_file);
            println!("Configuration from: {}", config_file);
            for collector in &config.collectors {
                println!(
                    "{} = {:?}",
                    collector.exchange.to_string().bold(),
                    collector.symbols
                );
                println!(
                    "  snapshot_depth = {}, publish_depth = {}, snapshot_interval = {}s",
                    collector.snapshot_depth,
                    collector.publish_depth,
                    collector.snapshot_interval_secs
                );
            }
            println!("{} = {:?}", "nats.servers".bold(), config.nats.servers);
            println!(
                "{} = {}",
                "nats.jetstream.enabled".bold(),
                config.nats.jetstream.enabled
            );
            println!("{} = {}", "log.level".bold(), config.log.level);
            0
        }
        Some(ConfigAction::Reset) => {
            let default_config = Config::default();
            match default_config.save_to_file(config_file) {
                Ok(()) => {
                    println!("Configuration reset to defaults and saved to: {}", config_file);
                    0
                }
                Err(err) => {
                    eprintln!("failed to write {}: {:#}", config_file, err);
                    1
                }
            }
        }
        None => {
            println!("Configuration management commands:");
            println!("  bookstream config show   - Show current configuration");
            println!("  bookstream config reset  - Reset to default configuration");
            println!("  bookstream check         - Validate the configuration file");
            println!("\nEnvironment variables can override config:");
            println!("  BOOKSTREAM_SYMBOLS=BTCUSDT,ETHUSDT");
            println!("  BOOKSTREAM_NATS_SERVERS=nats://localhost:4222");
            println!("  BOOKSTREAM_LOG_LEVEL=debug");
            0
        }
    }
}
