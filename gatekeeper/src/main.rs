//! `gatekeeper` command-line entry point.
//!
//! Results go to stdout as JSON; diagnostics go to stderr via `tracing`.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use gatekeeper::core::clock::system_clock;
use gatekeeper::core::types::{ValidationContext, VerifyPreset};
use gatekeeper::core::verdict::{VerdictSource, parse_verdict};
use gatekeeper::exit_codes;
use gatekeeper::gates::provider::FsGateProvider;
use gatekeeper::gates::validator::GateValidator;
use gatekeeper::injection::decision::InjectionDecisionService;
use gatekeeper::injection::overrides::SessionOverrideManager;
use gatekeeper::injection::types::{InjectionContext, InjectionModifier, InjectionType};
use gatekeeper::io::checkpoint::GitCheckpoint;
use gatekeeper::io::config::{DEFAULT_CONFIG_FILE, GatekeeperConfig, load_config};
use gatekeeper::io::git::Git;
use gatekeeper::io::shell_verify::{ShellVerifyConfig, ShellVerifyExecutor};
use gatekeeper::io::verify_state::VerifyActiveStateManager;
use gatekeeper::logging;
use gatekeeper::verify_loop::{AttemptOutcome, ShellVerifyLoop, StopHookInput, evaluate_stop_hook};

#[derive(Parser)]
#[command(
    name = "gatekeeper",
    version,
    about = "Quality gates, shell verification, and injection decisions for prompt chains"
)]
struct Cli {
    /// Config file (missing file means defaults).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a verification command once; in loop mode, arm the stop hook on failure.
    Verify {
        #[arg(long)]
        command: String,
        #[arg(long, default_value = "cli")]
        session: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        working_dir: Option<PathBuf>,
        #[arg(long)]
        max_iterations: Option<u32>,
        #[arg(long, value_enum)]
        preset: Option<PresetArg>,
        /// Keep the loop state on disk so the stop hook re-runs the command.
        #[arg(long = "loop")]
        loop_mode: bool,
        /// Stash tracked changes before the attempt.
        #[arg(long)]
        checkpoint: bool,
        /// Restore the checkpoint when the attempt fails.
        #[arg(long)]
        rollback: bool,
    },
    /// Agent stop hook: reads hook JSON on stdin, prints the decision.
    StopHook,
    /// Validate step output against a gate definition from the gates directory.
    ValidateGate {
        gate_id: String,
        #[arg(long)]
        gates_dir: Option<PathBuf>,
        /// File holding the step output (stdin when omitted).
        #[arg(long)]
        content_file: Option<PathBuf>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        framework: Option<String>,
    },
    /// Print injection decisions for one step.
    Decide {
        #[arg(long)]
        session: String,
        #[arg(long)]
        step: u32,
        #[arg(long)]
        total_steps: Option<u32>,
        #[arg(long)]
        chain: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        step_type: Option<String>,
        #[arg(long)]
        previous_result: Option<String>,
        #[arg(long = "modifier", value_enum)]
        modifiers: Vec<ModifierArg>,
        /// Limit output to one injection type.
        #[arg(long = "type", value_enum)]
        injection_type: Option<InjectionTypeArg>,
    },
    /// Parse a `GATE_REVIEW: PASS|FAIL - <reason>` verdict.
    ParseVerdict {
        text: String,
        /// Accept the bare `PASS - reason` form.
        #[arg(long)]
        gate_produced: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PresetArg {
    Fast,
    Full,
    Extended,
}

impl From<PresetArg> for VerifyPreset {
    fn from(value: PresetArg) -> Self {
        match value {
            PresetArg::Fast => VerifyPreset::Fast,
            PresetArg::Full => VerifyPreset::Full,
            PresetArg::Extended => VerifyPreset::Extended,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModifierArg {
    Clean,
    Lean,
    Guided,
}

impl From<ModifierArg> for InjectionModifier {
    fn from(value: ModifierArg) -> Self {
        match value {
            ModifierArg::Clean => InjectionModifier::Clean,
            ModifierArg::Lean => InjectionModifier::Lean,
            ModifierArg::Guided => InjectionModifier::Guided,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum InjectionTypeArg {
    SystemPrompt,
    GateGuidance,
    StyleGuidance,
}

impl From<InjectionTypeArg> for InjectionType {
    fn from(value: InjectionTypeArg) -> Self {
        match value {
            InjectionTypeArg::SystemPrompt => InjectionType::SystemPrompt,
            InjectionTypeArg::GateGuidance => InjectionType::GateGuidance,
            InjectionTypeArg::StyleGuidance => InjectionType::StyleGuidance,
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    dispatch(cli.command, &cli.config)
}

fn dispatch(command: Command, config_path: &Path) -> Result<i32> {
    let config = || load_config(config_path);
    match command {
        Command::Verify {
            command,
            session,
            timeout_ms,
            working_dir,
            max_iterations,
            preset,
            loop_mode,
            checkpoint,
            rollback,
        } => {
            let verify = ShellVerifyConfig {
                timeout_ms,
                working_dir,
                max_iterations,
                preset: preset.map(VerifyPreset::from),
                loop_mode,
                checkpoint,
                rollback,
                ..ShellVerifyConfig::new(command)
            };
            cmd_verify(&config()?, &session, verify)
        }
        // The stop hook must never fail the host, so it tolerates config errors.
        Command::StopHook => cmd_stop_hook(config_path),
        Command::ValidateGate {
            gate_id,
            gates_dir,
            content_file,
            category,
            framework,
        } => {
            let ctx = ValidationContext {
                content: read_content(content_file.as_deref())?,
                category,
                framework,
                explicitly_requested: true,
                ..ValidationContext::default()
            };
            cmd_validate_gate(&config()?, &gate_id, gates_dir, &ctx)
        }
        Command::Decide {
            session,
            step,
            total_steps,
            chain,
            category,
            step_type,
            previous_result,
            modifiers,
            injection_type,
        } => {
            let mut ctx = InjectionContext::new(session, step);
            ctx.total_steps = total_steps;
            ctx.chain_id = chain;
            ctx.category_id = category;
            ctx.step_type = step_type;
            ctx.previous_step_result = previous_result;
            ctx.modifiers = modifiers.into_iter().map(InjectionModifier::from).collect();
            cmd_decide(&config()?, &ctx, injection_type.map(InjectionType::from))
        }
        Command::ParseVerdict {
            text,
            gate_produced,
        } => {
            let source = if gate_produced {
                VerdictSource::GateProduced
            } else {
                VerdictSource::UserSupplied
            };
            match parse_verdict(&text, source) {
                Some(verdict) => {
                    print_json(&verdict)?;
                    Ok(exit_codes::OK)
                }
                None => {
                    eprintln!("no verdict found; expected `GATE_REVIEW: PASS|FAIL - <reason>`");
                    Ok(exit_codes::INVALID)
                }
            }
        }
    }
}

fn cmd_verify(config: &GatekeeperConfig, session: &str, verify: ShellVerifyConfig) -> Result<i32> {
    let root = std::env::current_dir().context("resolve current directory")?;
    let settings = &config.verification;
    let executor = ShellVerifyExecutor::new(settings.default_timeout_ms, settings.output_limit_bytes);
    let clock = system_clock();
    let workdir = verify.working_dir.clone().unwrap_or_else(|| root.clone());
    let verify_loop = ShellVerifyLoop::new(
        Arc::new(executor),
        VerifyActiveStateManager::new(config.state_path(&root)),
        clock.clone(),
    )
    .with_default_max_iterations(settings.default_max_iterations)
    .with_checkpoints(GitCheckpoint::new(Git::new(workdir), clock));

    verify_loop.begin(session, verify)?;
    let outcome = verify_loop.attempt(session)?;
    let code = if outcome.passed() {
        exit_codes::OK
    } else {
        exit_codes::GATE_FAILED
    };
    match &outcome {
        AttemptOutcome::Passed { iteration, result } => print_json(&serde_json::json!({
            "status": "passed",
            "iteration": iteration,
            "result": result,
        }))?,
        AttemptOutcome::Retry {
            iteration,
            max_iterations,
            result,
            feedback,
            rolled_back,
        } => print_json(&serde_json::json!({
            "status": "retry",
            "iteration": iteration,
            "maxIterations": max_iterations,
            "rolledBack": rolled_back,
            "feedback": feedback,
            "result": result,
        }))?,
        AttemptOutcome::Exhausted {
            iteration,
            result,
            rolled_back,
        } => print_json(&serde_json::json!({
            "status": "exhausted",
            "iteration": iteration,
            "rolledBack": rolled_back,
            "result": result,
        }))?,
    }
    Ok(code)
}

fn cmd_stop_hook(config_path: &Path) -> Result<i32> {
    let root = std::env::current_dir().context("resolve current directory")?;
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(err = %format!("{err:#}"), "config unusable; using defaults for stop hook");
            GatekeeperConfig::default()
        }
    };
    let mut raw = String::new();
    // Unreadable or malformed input is treated as an empty object.
    let _ = std::io::stdin().read_to_string(&mut raw);
    let input: StopHookInput = serde_json::from_str(&raw).unwrap_or_default();

    let executor = ShellVerifyExecutor::new(
        config.verification.default_timeout_ms,
        config.verification.output_limit_bytes,
    );
    let state_file = VerifyActiveStateManager::new(config.state_path(&root));
    if let Some(json) = evaluate_stop_hook(&state_file, &executor, &input).to_json() {
        print_json(&json)?;
    }
    Ok(exit_codes::OK)
}

fn cmd_validate_gate(
    config: &GatekeeperConfig,
    gate_id: &str,
    gates_dir: Option<PathBuf>,
    ctx: &ValidationContext,
) -> Result<i32> {
    let dir = gates_dir
        .or_else(|| config.validation.gates_dir.clone())
        .unwrap_or_else(|| PathBuf::from("gates"));
    let provider = FsGateProvider::new(dir)?;
    let executor = ShellVerifyExecutor::new(
        config.verification.default_timeout_ms,
        config.verification.output_limit_bytes,
    );
    let validator = GateValidator::new(Arc::new(provider), Arc::new(executor), system_clock())
        .with_stats_window(config.validation.stats_window)
        .with_semantic(config.semantic.clone(), None);

    let Some(result) = validator.validate_gate(gate_id, ctx) else {
        eprintln!("gate '{gate_id}' not found or invalid");
        return Ok(exit_codes::INVALID);
    };
    print_json(&result)?;
    Ok(if result.passed {
        exit_codes::OK
    } else {
        exit_codes::GATE_FAILED
    })
}

fn cmd_decide(
    config: &GatekeeperConfig,
    ctx: &InjectionContext,
    only: Option<InjectionType>,
) -> Result<i32> {
    let clock = system_clock();
    let service = InjectionDecisionService::new(
        config.injection.clone(),
        Arc::new(SessionOverrideManager::new(clock.clone())),
        clock,
    );
    let decisions = match only {
        Some(injection_type) => vec![service.decide(injection_type, ctx)],
        None => service.decide_all(ctx),
    };
    print_json(&decisions)?;
    Ok(exit_codes::OK)
}

fn read_content(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => fs::read_to_string(path).with_context(|| format!("read {}", path.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read step output from stdin")?;
            Ok(buf)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
