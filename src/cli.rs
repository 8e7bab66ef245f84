use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::TitleConfig;

pub const YOLO_FLAG: &str = "--dangerously-bypass-approvals-and-sandbox";

#[derive(Parser, Debug)]
#[command(
    name = "codex-title",
    version,
    about = "Run Codex with a terminal tab title that follows the current turn"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file to use instead of the default location.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run health diagnostics for setup and runtime requirements.
    Doctor,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Print the title the current session would show, then exit.
    #[arg(long, conflicts_with = "watch_only")]
    pub status: bool,

    /// Follow the most relevant session log without starting Codex.
    #[arg(long)]
    pub watch_only: bool,

    /// Bind this log instead of discovering one.
    #[arg(long, value_name = "PATH", hide = true)]
    pub log: Option<PathBuf>,

    /// Look for today's logs here instead of the dated sessions bucket.
    #[arg(long, value_name = "DIR", hide = true)]
    pub session_dir: Option<PathBuf>,

    #[arg(long, value_name = "TITLE")]
    pub new_title: Option<String>,

    #[arg(long, value_name = "TITLE")]
    pub running_title: Option<String>,

    #[arg(long, value_name = "TITLE")]
    pub done_title: Option<String>,

    #[arg(long, value_name = "TITLE")]
    pub no_commit_title: Option<String>,

    #[arg(long, value_name = "TITLE")]
    pub stalled_title: Option<String>,

    /// Start Codex with approvals and sandboxing bypassed.
    #[arg(long)]
    pub yolo: bool,

    #[arg(
        value_name = "CODEX_ARGS",
        help = "Arguments passed directly to `codex`",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub codex_args: Vec<String>,
}

impl RunArgs {
    pub fn apply_title_overrides(&self, cfg: &mut TitleConfig) {
        for (flag, slot) in [
            (&self.new_title, &mut cfg.new_title),
            (&self.running_title, &mut cfg.running_title),
            (&self.done_title, &mut cfg.done_title),
            (&self.no_commit_title, &mut cfg.no_commit_title),
            (&self.stalled_title, &mut cfg.stalled_title),
        ] {
            if let Some(value) = flag {
                slot.clone_from(value);
            }
        }
    }

    pub fn child_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.codex_args.len() + 1);
        if self.yolo && !self.codex_args.iter().any(|arg| arg == YOLO_FLAG) {
            args.push(YOLO_FLAG.to_string());
        }
        args.extend(self.codex_args.iter().cloned());
        args
    }
}
