use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use reelfeed::RunOptions;

fn main() {
    let options = match parse_args(std::env::args().skip(1)) {
        Ok(Some(options)) => options,
        Ok(None) => return,
        Err(err) => {
            eprintln!("error: {err:?}");
            std::process::exit(2);
        }
    };

    if let Err(err) = reelfeed::run(options) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

/// Returns `None` when a flag was handled and the process should exit.
fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<RunOptions>> {
    let mut options = RunOptions::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("ReelFeed {}", reelfeed::VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                println!(
                    "ReelFeed - Walk a vertical video feed headlessly.\n\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message\n  --config <path>      Read settings from this YAML file\n  --mpv                Play items in mpv instead of headless players\n  --items <n>          Number of posts to seed (default 12)"
                );
                return Ok(None);
            }
            "--config" => {
                let Some(path) = args.next() else {
                    bail!("--config needs a path");
                };
                options.config_file = Some(PathBuf::from(path));
            }
            "--mpv" => options.use_mpv = true,
            "--items" => {
                let Some(value) = args.next() else {
                    bail!("--items needs a number");
                };
                options.items = value
                    .parse()
                    .with_context(|| format!("invalid --items value {value:?}"))?;
            }
            other => bail!("unknown argument {other:?}, see --help"),
        }
    }
    Ok(Some(options))
}
