use std::{env, path::PathBuf};

use anyhow::{Result, anyhow};

const USAGE: &str = "usage: spirits [--config <path>] --turn <path>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub turn_path: PathBuf,
}

pub fn args_from_env() -> Result<CliArgs> {
    parse_args(env::args().skip(1))
}

pub fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs> {
    let mut args = args.into_iter();
    let mut config_path = None;
    let mut turn_path = None;

    while let Some(arg) = args.next() {
        let slot = match arg.as_str() {
            "--config" => &mut config_path,
            "--turn" => &mut turn_path,
            other => return Err(anyhow!("unknown argument: {other}. {USAGE}")),
        };
        let value = args
            .next()
            .ok_or_else(|| anyhow!("missing value for {arg}"))?;
        *slot = Some(PathBuf::from(value));
    }

    Ok(CliArgs {
        config_path: config_path.unwrap_or_else(|| PathBuf::from("./spirits.jsonc")),
        turn_path: turn_path.ok_or_else(|| anyhow!("missing --turn. {USAGE}"))?,
    })
}
