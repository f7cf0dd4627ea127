//! Interactive session supervisor.
//!
//! Drives a terminal program (an AI coding agent, typically) through a PTY in
//! an isolated workspace, answers its known prompts from the rule set, and
//! scores the outcome from verifiable evidence. State lives under
//! `.overseer/` in the project directory.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use overseer::core::rules::{RuleAction, RuleSpec};
use overseer::exit_codes;
use overseer::io::config::{OverseerConfig, load_config, write_config};
use overseer::io::event_log::read_tail;
use overseer::io::rules_store::{load_rules, write_rules};
use overseer::orchestrator::Orchestrator;
use overseer::task::{DecompositionPattern, TaskOptions, TaskStatus};

#[derive(Parser)]
#[command(
    name = "overseer",
    version,
    about = "Supervisor for long-running interactive agent sessions"
)]
struct Cli {
    /// Project directory to operate on.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.overseer/config.toml` and a starter rule set if missing.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Submit a prompt and supervise it to completion.
    Run {
        /// The goal handed to the controlled program.
        prompt: String,
        /// How to decompose the goal into child tasks.
        #[arg(long, value_enum, default_value = "none")]
        pattern: PatternArg,
        /// Number of children for decomposed patterns.
        #[arg(long, default_value_t = 3)]
        fan_out: u32,
        /// Maximum decomposition depth.
        #[arg(long, default_value_t = 3)]
        max_depth: u32,
    },
    /// Print the most recent events from the log.
    Tail {
        #[arg(short, long, default_value_t = 20)]
        count: usize,
    },
    /// Check the rule set against the bundled schema.
    ValidateRules,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum PatternArg {
    None,
    Decompose,
    Parallel,
    Sequential,
    Recursive,
}

impl From<PatternArg> for DecompositionPattern {
    fn from(value: PatternArg) -> Self {
        match value {
            PatternArg::None => DecompositionPattern::None,
            PatternArg::Decompose => DecompositionPattern::Decompose,
            PatternArg::Parallel => DecompositionPattern::Parallel,
            PatternArg::Sequential => DecompositionPattern::Sequential,
            PatternArg::Recursive => DecompositionPattern::Recursive,
        }
    }
}

fn main() -> ExitCode {
    overseer::logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(exit_codes::INVALID as u8)
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let state_dir = cli.root.join(".overseer");
    match cli.command {
        Command::Init { force } => cmd_init(&state_dir, force),
        Command::Run {
            prompt,
            pattern,
            fan_out,
            max_depth,
        } => cmd_run(&cli.root, &state_dir, &prompt, pattern, fan_out, max_depth),
        Command::Tail { count } => cmd_tail(&state_dir, count),
        Command::ValidateRules => cmd_validate_rules(&state_dir),
    }
}

fn cmd_init(state_dir: &Path, force: bool) -> Result<i32> {
    let config_path = state_dir.join("config.toml");
    let rules_path = state_dir.join("rules.json");

    if config_path.exists() && !force {
        println!("config exists: {}", config_path.display());
    } else {
        write_config(&config_path, &OverseerConfig::default())?;
        println!("wrote {}", config_path.display());
    }

    if rules_path.exists() && !force {
        println!("rules exist: {}", rules_path.display());
    } else {
        write_rules(&rules_path, &starter_rules())?;
        println!("wrote {}", rules_path.display());
    }
    Ok(exit_codes::OK)
}

/// Rules that cover the usual free-text prompts of terminal agents: yes/no
/// confirmations, "press enter" gates, and trust dialogs.
fn starter_rules() -> Vec<RuleSpec> {
    vec![
        RuleSpec {
            id: "confirm-yes-no".to_string(),
            pattern: r"\[y/N\]|\(y/n\)|yes/no".to_string(),
            action: RuleAction::Send {
                input: "y\n".to_string(),
            },
            priority: 10,
            cooldown_ms: 5_000,
        },
        RuleSpec {
            id: "press-enter".to_string(),
            pattern: r"[Pp]ress [Ee]nter to continue".to_string(),
            action: RuleAction::Send {
                input: "\n".to_string(),
            },
            priority: 5,
            cooldown_ms: 5_000,
        },
        RuleSpec {
            id: "trust-folder".to_string(),
            pattern: r"[Dd]o you trust the files in this folder".to_string(),
            action: RuleAction::Send {
                input: "1\n".to_string(),
            },
            priority: 10,
            cooldown_ms: 30_000,
        },
    ]
}

fn cmd_run(
    root: &Path,
    state_dir: &Path,
    prompt: &str,
    pattern: PatternArg,
    fan_out: u32,
    max_depth: u32,
) -> Result<i32> {
    let config = load_config(&state_dir.join("config.toml"))?;
    let rules = load_rules(&state_dir.join("rules.json"))?;

    let orchestrator = Orchestrator::builder(config, root)
        .state_dir(state_dir)
        .rules(rules)
        .build()?;

    let options = TaskOptions {
        decomposition_pattern: pattern.into(),
        fan_out,
        max_depth,
        live_notify: false,
    };
    let root_id = orchestrator.submit(prompt, options).context("submit")?;
    println!("submitted {root_id}");
    orchestrator.join(&root_id)?;

    let mut code = exit_codes::TASK_FAILED;
    for task in orchestrator.status("*") {
        let marker = match task.status {
            TaskStatus::Completed => "ok",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            _ => "open",
        };
        println!(
            "{:10} {:9} depth={} visits={} reward={:.2} {}",
            task.id,
            marker,
            task.depth,
            task.visits,
            task.average_reward(),
            truncate(&task.prompt, 60)
        );
        if task.id == root_id && task.status == TaskStatus::Completed {
            code = exit_codes::OK;
        }
    }
    Ok(code)
}

fn cmd_tail(state_dir: &Path, count: usize) -> Result<i32> {
    let events = read_tail(&state_dir.join("events.jsonl"), count)?;
    for event in events {
        println!(
            "{} {:24} {}",
            event.ts_ms,
            event.kind,
            if event.task_id.is_empty() {
                "-".to_string()
            } else {
                event.task_id
            }
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_validate_rules(state_dir: &Path) -> Result<i32> {
    let path = state_dir.join("rules.json");
    match load_rules(&path) {
        Ok(rules) => {
            println!("{} rules ok ({})", rules.len(), path.display());
            Ok(exit_codes::OK)
        }
        Err(err) => {
            eprintln!("{err:#}");
            Ok(exit_codes::INVALID)
        }
    }
}

fn truncate(s: &str, n: usize) -> String {
    let line = s.lines().next().unwrap_or_default();
    if line.len() <= n {
        return line.to_string();
    }
    let mut cut = n;
    while cut > 0 && !line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &line[..cut])
}
