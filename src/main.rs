use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use codex_title::app::{self, AppMode, LaunchOptions};
use codex_title::cli::{Cli, Commands};
use codex_title::config::{self, TitleConfig};
use codex_title::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("codex-title error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    let _log_guard = setup_tracing(config::diagnostics_log_path().as_deref());
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::config_path);

    if let Some(Commands::Doctor) = cli.command {
        return app::doctor(&config_path);
    }

    let mut config = TitleConfig::load_or_default(&config_path);
    config.apply_env_overrides();
    cli.run.apply_title_overrides(&mut config);

    let mode = if cli.run.status {
        AppMode::Status
    } else if cli.run.watch_only {
        AppMode::WatchOnly
    } else {
        AppMode::Wrap {
            args: cli.run.child_args(),
        }
    };
    let launch = LaunchOptions {
        explicit_log: cli.run.log,
        session_dir: cli.run.session_dir,
    };
    app::run(config, mode, config::runtime_settings(), launch)
}
