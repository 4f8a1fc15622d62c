use anyhow::{Context, Result};

use spirits::{
    cli::args_from_env,
    config::Config,
    logging::init_tracing,
    replay::{load_turn, run_recorded_turn},
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = args_from_env()?;
    let config = Config::load(&args.config_path)
        .with_context(|| format!("failed to load config from {}", args.config_path.display()))?;
    let _logging_guard = init_tracing(&config.logging)?;

    let turn = load_turn(&args.turn_path)?;
    let event = run_recorded_turn(&config.project, turn).await?;

    let rendered =
        serde_json::to_string_pretty(&event).context("failed to render conversation event")?;
    println!("{rendered}");
    Ok(())
}
