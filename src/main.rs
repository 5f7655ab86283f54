use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use dotenv::dotenv;
use impulse_wars_trainer::AppConfig;
use impulse_wars_trainer::app::{self, Mode, UnlinkedEngine};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Train, evaluate and sweep drone-arena agents
#[derive(Parser, Debug)]
#[command(name = "impulse-wars", version)]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::Train)]
    mode: Mode,
    /// Model to evaluate; defaults to the latest checkpoint of --exp-id
    #[arg(long)]
    eval_model_path: Option<PathBuf>,
    #[command(flatten)]
    config: AppConfig,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("impulse_wars_trainer=info,info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_logging();

    let raw_args: Vec<String> = std::env::args().collect();
    let cli = Cli::parse();
    let config = cli.config.resolve()?;
    tracing::info!(
        "Mode {:?}, experiment {}, seed {:?}",
        cli.mode,
        config.train.exp_id(),
        config.train.seed
    );

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, shutting down");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let mode = cli.mode;
    let eval_model_path = cli.eval_model_path;
    let result = tokio::task::spawn_blocking(move || {
        app::run(mode, config, eval_model_path, &UnlinkedEngine, interrupt, &raw_args)
    })
    .await?;

    if let Err(e) = &result {
        tracing::error!("{e:?}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_mode_and_config() {
        let cli = Cli::parse_from(["impulse-wars", "--mode", "sweep-child", "--sweep-id", "abc"]);
        assert_eq!(cli.mode, Mode::SweepChild);
        assert_eq!(cli.config.sweep.sweep_id.as_deref(), Some("abc"));
    }
}
