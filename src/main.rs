use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use mqtg_bot::infrastructure::config::Config;
use mqtg_bot::runtime::{signals, BotInstance};

#[derive(Parser)]
#[command(name = "mqtg-bot")]
#[command(about = "Forwards MQTT messages to Telegram chats", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot
    Run,
    /// Show version
    Version,
    /// Generate default config
    InitConfig,
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            if let Err(e) = run_bot(cli.config) {
                tracing::error!("{}", e);
                std::process::exit(1);
            }
        }
        Commands::Version => {
            println!("mqtg-bot v{}", env!("CARGO_PKG_VERSION"));
        }
        Commands::InitConfig => {
            init_config(&cli.config);
        }
    }
}

fn run_bot(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_with_env(&config_path);
    config.validate()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let bot = BotInstance::start(&config).await?;

        tokio::select! {
            res = signals::wait_for_shutdown_signal() => match res {
                Ok(signal) => tracing::info!("Stopping on {}", signal),
                Err(e) => tracing::error!("Failed to listen for signals: {}", e),
            },
            _ = bot.workers_finished() => {
                tracing::warn!("All workers exited on their own");
            }
        }

        if let Err(e) = bot.shutdown() {
            tracing::error!("Shutdown: {}", e);
        }
        bot.wait().await;
        tracing::info!("Bye");
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

fn init_config(path: &Path) {
    if path.exists() {
        eprintln!("{} already exists, not overwriting", path.display());
        std::process::exit(1);
    }

    let yaml = match Config::default().to_yaml() {
        Ok(yaml) => yaml,
        Err(e) => {
            eprintln!("Failed to render config: {}", e);
            std::process::exit(1);
        }
    };

    match std::fs::write(path, yaml) {
        Ok(()) => println!("Wrote default config to {}", path.display()),
        Err(e) => {
            eprintln!("Failed to write {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}
