use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use prompt_runner::backend::HttpJobBackend;
use prompt_runner::config::{self, PromptRunnerConfig, CONFIG_FILE_NAME};
use prompt_runner::dispatcher::{spawn_dispatcher, DispatcherHandle, DispatcherOptions};
use prompt_runner::error::RunError;
use prompt_runner::log::LogLevel;
use prompt_runner::resume;
use prompt_runner::sink::{AlertLog, OutputStore};
use prompt_runner::types::RunMode;
use prompt_runner::{log_info, log_warn};

#[derive(Parser)]
#[command(
    name = "prompt-runner",
    about = "Run prompts against documents with multiple LLM profiles"
)]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/prompt-runner.toml).
    /// When specified, the resume path resolves from the config file's parent directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter prompt-runner.toml
    Init,
    /// Queue a combinatorial run and wait for every request to settle
    Run {
        /// Which prompts, profiles, and documents to combine
        #[arg(value_enum)]
        mode: ModeArg,
        /// Prompt id (required by one-prompt modes)
        #[arg(long)]
        prompt: Option<String>,
        /// LLM profile id (required by one-profile modes)
        #[arg(long)]
        profile: Option<String>,
        /// Document id (required by one-doc modes)
        #[arg(long)]
        document: Option<String>,
        /// Document whose results are published as they arrive
        #[arg(long)]
        focus: Option<String>,
    },
    /// Show the saved resume snapshot, if any
    Pending,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    OnePromptOneProfileOneDoc,
    OnePromptOneProfileAllDocs,
    OnePromptAllProfilesOneDoc,
    OnePromptAllProfilesAllDocs,
    AllPromptsOneProfileOneDoc,
    AllPromptsAllProfilesOneDoc,
    AllPromptsAllProfilesAllDocs,
}

fn required(value: Option<String>, flag: &str, mode: ModeArg) -> Result<String, String> {
    value.ok_or_else(|| format!("--{} is required for mode {:?}", flag, mode))
}

fn build_run_mode(
    mode: ModeArg,
    prompt: Option<String>,
    profile: Option<String>,
    document: Option<String>,
) -> Result<RunMode, String> {
    Ok(match mode {
        ModeArg::OnePromptOneProfileOneDoc => RunMode::OnePromptOneProfileOneDoc {
            prompt_id: required(prompt, "prompt", mode)?,
            profile_id: required(profile, "profile", mode)?,
            document_id: required(document, "document", mode)?,
        },
        ModeArg::OnePromptOneProfileAllDocs => RunMode::OnePromptOneProfileAllDocs {
            prompt_id: required(prompt, "prompt", mode)?,
            profile_id: required(profile, "profile", mode)?,
        },
        ModeArg::OnePromptAllProfilesOneDoc => RunMode::OnePromptAllProfilesOneDoc {
            prompt_id: required(prompt, "prompt", mode)?,
            document_id: required(document, "document", mode)?,
        },
        ModeArg::OnePromptAllProfilesAllDocs => RunMode::OnePromptAllProfilesAllDocs {
            prompt_id: required(prompt, "prompt", mode)?,
        },
        ModeArg::AllPromptsOneProfileOneDoc => RunMode::AllPromptsOneProfileOneDoc {
            profile_id: required(profile, "profile", mode)?,
            document_id: required(document, "document", mode)?,
        },
        ModeArg::AllPromptsAllProfilesOneDoc => RunMode::AllPromptsAllProfilesOneDoc {
            document_id: required(document, "document", mode)?,
        },
        ModeArg::AllPromptsAllProfilesAllDocs => RunMode::AllPromptsAllProfilesAllDocs,
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.log_level.parse::<LogLevel>() {
        Ok(level) => prompt_runner::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let root = &cli.root;
    let config_base = match &cli.config {
        Some(p) => p.parent().unwrap_or(Path::new(".")).to_path_buf(),
        None => root.to_path_buf(),
    };

    let result = match cli.command {
        Commands::Init => handle_init(root),
        Commands::Run {
            mode,
            prompt,
            profile,
            document,
            focus,
        } => match build_run_mode(mode, prompt, profile, document) {
            Ok(run_mode) => {
                handle_run(cli.config.as_deref(), root, &config_base, run_mode, focus).await
            }
            Err(e) => Err(e),
        },
        Commands::Pending => handle_pending(cli.config.as_deref(), root, &config_base),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn handle_init(root: &Path) -> Result<(), String> {
    let config_path = root.join(CONFIG_FILE_NAME);
    if config_path.exists() {
        println!("{} already exists, leaving it untouched", config_path.display());
        return Ok(());
    }

    let contents = r#"[scheduler]
max_active = 5            # concurrent runs
poll_interval_secs = 5
max_wait_secs = 30

[backend]
base_url = "http://localhost:8000"
submit_path = "/api/prompt-runs"
request_timeout_secs = 30     # must not exceed max_wait_secs

[resume]
enabled = false           # save pending runs on Ctrl-C and resume on next start
path = ".prompt-runner/pending-runs.json"
ttl_secs = 300

[catalog]
prompts = []
profiles = []
documents = []
# focused_document = ""
"#;

    fs::create_dir_all(root)
        .map_err(|e| format!("Failed to create {}: {}", root.display(), e))?;
    fs::write(&config_path, contents)
        .map_err(|e| format!("Failed to write {}: {}", config_path.display(), e))?;

    println!("Created {}", config_path.display());
    Ok(())
}

fn handle_pending(
    config_path: Option<&Path>,
    root: &Path,
    config_base: &Path,
) -> Result<(), String> {
    let config = config::load_config_from(config_path, root)?;
    let path = config.resume.resolve_path(config_base);

    match resume::peek(&path)? {
        None => println!("No pending runs saved."),
        Some(snapshot) => {
            let ttl = Duration::from_secs(config.resume.ttl_secs);
            let expired = snapshot.is_expired(chrono::Utc::now(), ttl);
            println!(
                "{} pending run(s) saved at {}{}",
                snapshot.entries.len(),
                snapshot.saved_at.to_rfc3339(),
                if expired { " (expired)" } else { "" }
            );
            for request in &snapshot.entries {
                println!("  {}", request.key());
            }
        }
    }
    Ok(())
}

async fn handle_run(
    config_path: Option<&Path>,
    root: &Path,
    config_base: &Path,
    run_mode: RunMode,
    focus: Option<String>,
) -> Result<(), String> {
    let config = config::load_config_from(config_path, root)?;
    log_config_summary(&config);

    let backend = Arc::new(HttpJobBackend::new(&config.backend)?);
    log_info!("[config] Endpoint: {}", backend.url());

    let outputs = Arc::new(OutputStore::new());
    let alerts = Arc::new(AlertLog::new());
    let mut options = DispatcherOptions::from_config(&config);
    if focus.is_some() {
        options.focused_document = focus;
    }

    let (handle, dispatcher_task) =
        spawn_dispatcher(backend, outputs.clone(), alerts.clone(), options);

    let resume_path = config.resume.resolve_path(config_base);
    if config.resume.enabled {
        let ttl = Duration::from_secs(config.resume.ttl_secs);
        if let Some(requests) = resume::take(&resume_path, ttl)? {
            handle.restore(requests).await?;
        }
    }

    let queued = handle.enqueue_run(run_mode).await?;
    log_info!("Queued {} run(s)", queued);

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    match handle.wait_idle_or_cancelled(&cancel).await {
        Ok(()) => {}
        Err(RunError::Interrupted) => {
            let pending = handle.pending_requests().await?;
            let unfinished = pending.len();
            log_warn!("Interrupted; abandoning {} unfinished run(s)", unfinished);
            if config.resume.enabled {
                resume::save(&resume_path, pending)?;
            }
            return Err(format!("Interrupted with {} run(s) unfinished", unfinished));
        }
        Err(e) => return Err(e.to_string()),
    }

    print_outputs(&outputs, &alerts, &handle).await;

    drop(handle);
    let summary = dispatcher_task
        .await
        .map_err(|e| format!("Dispatcher task failed: {}", e))?;

    println!(
        "\n{} admitted, {} succeeded, {} failed, {} timed out",
        summary.admitted, summary.succeeded, summary.failed, summary.timed_out
    );

    if summary.failed + summary.timed_out > 0 {
        return Err(format!(
            "{} run(s) did not complete",
            summary.failed + summary.timed_out
        ));
    }
    Ok(())
}

fn log_config_summary(config: &PromptRunnerConfig) {
    log_info!("--- Prompt Runner ---");
    log_info!(
        "[config] Scheduler: max_active={}, poll_interval={}s, max_wait={}s",
        config.scheduler.max_active,
        config.scheduler.poll_interval_secs,
        config.scheduler.max_wait_secs,
    );
    log_info!(
        "[config] Catalog: {} prompt(s), {} profile(s), {} document(s)",
        config.catalog.prompts.len(),
        config.catalog.profiles.len(),
        config.catalog.documents.len(),
    );
    if config.resume.enabled {
        log_info!(
            "[config] Resume: {} (ttl {}s)",
            config.resume.path,
            config.resume.ttl_secs
        );
    }
}

async fn print_outputs(outputs: &OutputStore, alerts: &AlertLog, handle: &DispatcherHandle) {
    if let Ok(snapshot) = handle.queue_snapshot().await {
        log_info!(
            "Queue drained (active={}, queued={})",
            snapshot.active,
            snapshot.queued
        );
    }

    for (key, entry) in outputs.entries() {
        match entry.output {
            Some(output) => println!("{} = {}", key, output),
            None if entry.is_loading => println!("{} = (loading)", key),
            None => println!("{} = (no output)", key),
        }
    }

    let messages = alerts.messages();
    if !messages.is_empty() {
        println!("\n{} alert(s):", messages.len());
        for message in messages {
            println!("  - {}", message);
        }
    }
}
