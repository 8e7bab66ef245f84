use std::env;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::binding::{BindingOptions, SessionBinder, TitleWriter};
use crate::candidate::LogCandidate;
use crate::config::{CodexPaths, RuntimeSettings, TitleConfig};
use crate::discovery::{
    DiscoveryRequest, LogDiscovery, LogSource, OpenFiles, ProcessOpenFiles, ResolvedLog,
};
use crate::git;
use crate::reader::{REPLAY_MAX_BYTES, REPLAY_MAX_LINES, read_tail_window};
use crate::title::{TerminalTitle, TitleSet};
use crate::turn::{self, Replay, TitleState};

#[derive(Debug, Clone)]
pub enum AppMode {
    Wrap { args: Vec<String> },
    WatchOnly,
    Status,
}

/// Discovery knobs that come from the command line rather than the config file.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub explicit_log: Option<PathBuf>,
    pub session_dir: Option<PathBuf>,
}

pub fn run(
    config: TitleConfig,
    mode: AppMode,
    runtime: RuntimeSettings,
    launch: LaunchOptions,
) -> Result<u8> {
    match mode {
        AppMode::Wrap { args } => run_codex_wrapper(&config, runtime, launch, args),
        AppMode::WatchOnly => run_watch_only(&config, runtime, launch),
        AppMode::Status => {
            print_status(&config, runtime, &launch)?;
            Ok(0)
        }
    }
}

fn run_codex_wrapper(
    config: &TitleConfig,
    runtime: RuntimeSettings,
    launch: LaunchOptions,
    args: Vec<String>,
) -> Result<u8> {
    let titles = TitleSet::from_config(config);
    let mut writer = TitleWriter::new(Box::new(TerminalTitle::open()));
    writer.show(&titles.new);

    // Only a failed spawn stops codex from running; anything else just
    // leaves the title unmanaged.
    let request = discovery_request(runtime, &launch, None)
        .inspect_err(|err| warn!(error = %format!("{err:#}"), "title binding disabled"))
        .ok();
    if let Err(err) = install_interrupt_passthrough() {
        warn!(error = %format!("{err:#}"), "Ctrl+C passthrough unavailable");
    }
    let mut child = spawn_codex_child(args)?;
    let binder = request.and_then(|mut request| {
        request.pid = Some(child.id());
        let discovery = LogDiscovery::new(request, Box::new(ProcessOpenFiles::detect()));
        SessionBinder::spawn(
            discovery,
            binding_options(config, runtime, titles, launch.explicit_log),
            writer,
            Arc::new(AtomicBool::new(false)),
        )
        .inspect_err(|err| warn!(error = %format!("{err:#}"), "title binding was not started"))
        .ok()
    });

    let status = child.wait().context("failed to wait for codex child process");
    if let Some(binder) = binder {
        let last = binder.stop();
        debug!(title = ?last.title, state = last.title_state.as_str(), "binding stopped");
    }

    let status = status?;
    info!(%status, "codex exited");
    Ok(status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1))
}

fn run_watch_only(
    config: &TitleConfig,
    runtime: RuntimeSettings,
    launch: LaunchOptions,
) -> Result<u8> {
    let stop = install_stop_signal()?;
    let titles = TitleSet::from_config(config);
    let mut writer = TitleWriter::new(Box::new(TerminalTitle::open()));
    writer.show(&titles.new);

    let discovery = LogDiscovery::new(
        discovery_request(runtime, &launch, None)?,
        Box::new(ProcessOpenFiles::detect()),
    );
    let binder = SessionBinder::spawn(
        discovery,
        binding_options(config, runtime, titles, launch.explicit_log),
        writer,
        Arc::clone(&stop),
    )?;

    while !stop.load(Ordering::Relaxed) && !binder.is_finished() {
        thread::sleep(runtime.poll_interval);
    }

    let last = binder.stop();
    if last.bound.is_none() {
        println!("No Codex session log found to watch.");
    }
    Ok(0)
}

pub fn print_status(
    config: &TitleConfig,
    runtime: RuntimeSettings,
    launch: &LaunchOptions,
) -> Result<()> {
    let titles = TitleSet::from_config(config);
    let resolved = match &launch.explicit_log {
        Some(path) => Some(ResolvedLog {
            path: path.clone(),
            source: LogSource::Explicit,
        }),
        None => LogDiscovery::new(
            discovery_request(runtime, launch, None)?,
            Box::new(ProcessOpenFiles::detect()),
        )
        .resolve_fallback(),
    };

    let Some(resolved) = resolved else {
        println!("title: {}", titles.new);
        println!("log_path: none");
        return Ok(());
    };

    let window = read_tail_window(&resolved.path, REPLAY_MAX_BYTES, REPLAY_MAX_LINES)
        .with_context(|| format!("failed to read {}", resolved.path.display()))?;
    let replayed = turn::replay_tail(&window);
    let state = replayed.state.title_state;
    let shown = if state == TitleState::DoneNoCommit
        && config.verify_head_change
        && committed_during(&replayed)
    {
        TitleState::DoneCommitted
    } else {
        state
    };
    let session_id =
        LogCandidate::inspect(&resolved.path).and_then(|candidate| candidate.session_id);

    println!("title: {}", titles.render(shown, false));
    println!("state: {}", state.as_str());
    println!("log_path: {}", resolved.path.display());
    println!("source: {}", resolved.source.as_str());
    println!("session_id: {}", session_id.as_deref().unwrap_or("unknown"));
    Ok(())
}

pub fn doctor(config_path: &Path) -> Result<u8> {
    let mut issues = 0u8;
    let paths = CodexPaths::resolve();

    println!("codex-title doctor");
    println!("config_path: {}", config_path.display());
    println!("codex_home: {}", paths.home.display());

    if paths.sessions_root.is_dir() {
        println!("[OK] Sessions directory found: {}", paths.sessions_root.display());
    } else {
        issues += 1;
        println!(
            "[WARN] Sessions directory not found: {}",
            paths.sessions_root.display()
        );
    }

    for (label, path) in [("TUI log", &paths.tui_log), ("History file", &paths.history)] {
        if path.is_file() {
            println!("[OK] {label} found.");
        } else {
            println!("[INFO] {label} not found (discovery skips this step).");
        }
    }

    if command_available("codex") {
        println!("[OK] codex command available.");
    } else {
        issues += 1;
        println!("[WARN] codex command not found in PATH.");
    }

    if command_available("git") {
        println!("[OK] git command available.");
    } else {
        println!("[INFO] git command not found in PATH (commit detection relies on tool output).");
    }

    let open_files = ProcessOpenFiles::detect();
    match open_files.open_files(std::process::id()) {
        Ok(_) => println!(
            "[OK] Open-file inspection works ({}).",
            open_files.method().as_str()
        ),
        Err(err) => {
            issues += 1;
            println!("[WARN] Open-file inspection failed: {err}");
        }
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn committed_during(replayed: &Replay) -> bool {
    let (Some(start), Some(end)) = (replayed.turn_started_at, replayed.turn_finished_at) else {
        return false;
    };
    env::current_dir()
        .ok()
        .and_then(|cwd| git::repo_root(&cwd))
        .is_some_and(|repo| git::commit_in_range(&repo, start, end))
}

fn discovery_request(
    runtime: RuntimeSettings,
    launch: &LaunchOptions,
    pid: Option<u32>,
) -> Result<DiscoveryRequest> {
    Ok(DiscoveryRequest {
        cwd: env::current_dir().context("failed to resolve current directory")?,
        start_time: Utc::now(),
        pid,
        paths: CodexPaths::resolve(),
        session_dir: launch.session_dir.clone(),
        clock_skew: runtime.clock_skew,
    })
}

fn binding_options(
    config: &TitleConfig,
    runtime: RuntimeSettings,
    titles: TitleSet,
    explicit_log: Option<PathBuf>,
) -> BindingOptions {
    BindingOptions {
        settings: runtime,
        titles,
        verify_head_change: config.verify_head_change,
        explicit_log,
    }
}

fn spawn_codex_child(args: Vec<String>) -> Result<Child> {
    let mut command = Command::new("codex");
    command
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    command
        .spawn()
        .context("failed to spawn `codex` child process")
}

fn command_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Codex shares our process group and handles Ctrl+C itself; the wrapper
/// keeps waiting so the child decides when the session ends.
fn install_interrupt_passthrough() -> Result<()> {
    ctrlc::set_handler(|| debug!("interrupt forwarded to codex"))
        .context("failed to install Ctrl+C handler")
}

fn install_stop_signal() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}
