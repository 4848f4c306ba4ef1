//! Keel CLI - resumable workflow orchestration for coding agents
//!
//! Usage:
//!   keel init                         Write default `.keel/config.toml`
//!   keel run <feature> [--plan FILE]  Start a new workflow run
//!   keel resume [--decision D]        Continue the latest run
//!   keel status                       Show the latest checkpoint
//!   keel checkpoints                  List stored checkpoints

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use keel_agent::AgentRegistry;
use keel_core::{HumanDecision, KeelConfig, Task};
use keel_orchestrator::{render_status, DirectoryArtifactStore, RunOutcome, WorkflowEngine};
use keel_store::{CheckpointStore, FileCheckpointStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about = "Resumable multi-agent workflow orchestration")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Repository root (defaults to current directory)
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Start a new workflow run for a feature
    Run {
        /// Feature description handed to the planner
        feature: String,

        /// JSON task list to use instead of asking the planner
        #[arg(long, value_name = "FILE")]
        plan: Option<PathBuf>,
    },

    /// Resume the latest run, answering a pending escalation if any
    Resume {
        /// retry, skip, continue, answer_clarification or abort
        #[arg(long)]
        decision: Option<String>,

        /// Answer to a clarification question
        #[arg(long)]
        answer: Option<String>,

        /// Reason recorded with an abort
        #[arg(long)]
        reason: Option<String>,
    },

    /// Show the status of the latest checkpoint
    Status,

    /// List stored checkpoints
    Checkpoints,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Init { force } => cmd_init(&cli.root, force).await,
        Commands::Run { feature, plan } => cmd_run(&cli.root, feature, plan).await,
        Commands::Resume {
            decision,
            answer,
            reason,
        } => cmd_resume(&cli.root, decision, answer, reason).await,
        Commands::Status => cmd_status(&cli.root).await,
        Commands::Checkpoints => cmd_checkpoints(&cli.root).await,
    }
}

async fn cmd_init(root: &Path, force: bool) -> Result<()> {
    let config_path = root.join(KeelConfig::CONFIG_PATH);
    if config_path.exists() && !force {
        println!(
            "Config already exists at {} (use --force to overwrite)",
            config_path.display()
        );
        return Ok(());
    }

    let written = KeelConfig::write_default(root).context("Failed to write config")?;
    let paths = KeelConfig::default().paths.resolve(root);
    tokio::fs::create_dir_all(&paths.checkpoints)
        .await
        .with_context(|| format!("Failed to create {}", paths.checkpoints.display()))?;

    info!("Initialized Keel in {:?}", root);
    println!("Wrote {}", written.display());
    println!("\nNext steps:");
    println!("  1. Review agents and reviewers in the config");
    println!("  2. keel run \"<feature>\"");
    Ok(())
}

async fn cmd_run(root: &Path, feature: String, plan: Option<PathBuf>) -> Result<()> {
    let tasks = match plan {
        Some(path) => Some(load_plan(&path).await?),
        None => None,
    };

    let engine = build_engine(root).await?;
    let outcome = engine
        .start(&feature, tasks)
        .await
        .context("Workflow run failed")?;
    print_outcome(&outcome);
    Ok(())
}

async fn cmd_resume(
    root: &Path,
    decision: Option<String>,
    answer: Option<String>,
    reason: Option<String>,
) -> Result<()> {
    let decision = decision
        .map(|name| parse_decision(&name, answer, reason))
        .transpose()?;

    let engine = build_engine(root).await?;
    let outcome = engine
        .resume(decision)
        .await
        .context("Failed to resume workflow")?;
    print_outcome(&outcome);
    Ok(())
}

async fn cmd_status(root: &Path) -> Result<()> {
    let store = open_store(root).await?;
    match store.load_latest().await? {
        Some(state) => print!("{}", render_status(&state)),
        None => println!("No workflow runs found. Start one with `keel run <feature>`."),
    }
    Ok(())
}

async fn cmd_checkpoints(root: &Path) -> Result<()> {
    let store = open_store(root).await?;
    let checkpoints = store.list().await?;

    if checkpoints.is_empty() {
        println!("No checkpoints found");
        return Ok(());
    }

    println!("Checkpoints");
    println!("===========");
    for checkpoint in &checkpoints {
        println!(
            "  {:>4}  {:<16} {}  {}",
            checkpoint.sequence,
            checkpoint.phase.to_string(),
            checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"),
            &checkpoint.content_hash[..12.min(checkpoint.content_hash.len())]
        );
    }
    Ok(())
}

fn load_config(root: &Path) -> Result<KeelConfig> {
    KeelConfig::load_or_default(root).context("Failed to load .keel/config.toml")
}

async fn open_store(root: &Path) -> Result<FileCheckpointStore> {
    let paths = load_config(root)?.paths.resolve(root);
    FileCheckpointStore::open(&paths.checkpoints)
        .await
        .with_context(|| format!("Failed to open checkpoints in {}", paths.checkpoints.display()))
}

async fn build_engine(root: &Path) -> Result<WorkflowEngine> {
    let config = load_config(root)?;
    let paths = config.paths.resolve(root);
    let registry = AgentRegistry::from_config(&config.agents);
    let store = FileCheckpointStore::open(&paths.checkpoints)
        .await
        .with_context(|| format!("Failed to open checkpoints in {}", paths.checkpoints.display()))?;
    let artifacts = DirectoryArtifactStore::new(&paths.artifact_root);

    let engine = WorkflowEngine::new(config, registry, Arc::new(store), Arc::new(artifacts))
        .context("Invalid engine configuration")?
        .with_contexts_dir(&paths.contexts)
        .with_status_report(&paths.status_report);
    Ok(engine)
}

/// Read a plan file: either a task array or an object with a `tasks` field
async fn load_plan(path: &Path) -> Result<Vec<Task>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    parse_plan(&content).with_context(|| format!("Invalid plan {}", path.display()))
}

fn parse_plan(content: &str) -> Result<Vec<Task>> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    let tasks = match value {
        serde_json::Value::Object(mut map) => map
            .remove("tasks")
            .ok_or_else(|| anyhow!("plan object has no `tasks` field"))?,
        other => other,
    };
    let tasks: Vec<Task> = serde_json::from_value(tasks)?;
    if tasks.is_empty() {
        bail!("plan contains no tasks");
    }
    Ok(tasks)
}

fn parse_decision(
    name: &str,
    answer: Option<String>,
    reason: Option<String>,
) -> Result<HumanDecision> {
    let text = answer.or(reason);
    HumanDecision::parse(name, text).map_err(|e| anyhow!(e))
}

fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed => {
            println!("Workflow completed");
        }
        RunOutcome::Aborted { reason } => {
            println!("Workflow aborted: {}", reason);
        }
        RunOutcome::AwaitingHuman(request) => {
            println!("Human decision required");
            println!("=======================");
            println!("Phase: {}", request.phase);
            if let Some(task_id) = &request.task_id {
                println!("Task: {}", task_id);
            }
            if let Some(kind) = &request.kind {
                println!("Kind: {}", kind);
            }
            println!("Root cause: {}", request.root_cause);
            println!("Prior attempts: {}", request.prior_attempts);
            if !request.attempted_remedies.is_empty() {
                println!("\nAttempted remedies:");
                for remedy in &request.attempted_remedies {
                    println!("  - {}", remedy);
                }
            }
            if let Some(question) = &request.clarification_question {
                println!("\nQuestion: {}", question);
            }
            if !request.transcripts.is_empty() {
                println!("\nTranscripts:");
                for transcript in &request.transcripts {
                    println!("  {}", transcript);
                }
            }
            println!("\nOptions: {}", request.options().join(", "));
            println!("Resume with: keel resume --decision <option>");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan_array() {
        let tasks = parse_plan(r#"[{"id": "a", "title": "First"}]"#).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "a");
    }

    #[test]
    fn test_parse_plan_object() {
        let tasks = parse_plan(
            r#"{"tasks": [{"id": "a", "title": "First"}, {"id": "b", "title": "Second", "dependencies": ["a"]}]}"#,
        )
        .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].dependencies, vec!["a".to_string()]);
    }

    #[test]
    fn test_parse_plan_rejects_empty_and_missing() {
        assert!(parse_plan("[]").is_err());
        assert!(parse_plan(r#"{"steps": []}"#).is_err());
        assert!(parse_plan("not json").is_err());
    }

    #[test]
    fn test_parse_decision() {
        assert_eq!(
            parse_decision("retry", None, None).unwrap(),
            HumanDecision::Retry
        );
        assert_eq!(
            parse_decision("answer", Some("use postgres".into()), None).unwrap(),
            HumanDecision::AnswerClarification("use postgres".into())
        );
        assert_eq!(
            parse_decision("abort", None, Some("out of scope".into())).unwrap(),
            HumanDecision::Abort("out of scope".into())
        );
        assert!(parse_decision("answer", None, None).is_err());
        assert!(parse_decision("later", None, None).is_err());
    }

    #[test]
    fn test_cli_parses_run_and_resume() {
        let cli = Cli::try_parse_from(["keel", "run", "search", "--plan", "plan.json"]).unwrap();
        match cli.command {
            Commands::Run { feature, plan } => {
                assert_eq!(feature, "search");
                assert_eq!(plan, Some(PathBuf::from("plan.json")));
            }
            _ => panic!("expected run"),
        }

        let cli = Cli::try_parse_from(["keel", "resume", "--decision", "skip"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Resume { decision: Some(ref d), .. } if d == "skip"
        ));
    }

    #[tokio::test]
    async fn test_init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path(), false).await.unwrap();

        let config = KeelConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config, KeelConfig::default());
        assert!(dir.path().join(".keel/checkpoints").is_dir());
    }

    #[tokio::test]
    async fn test_status_and_checkpoints_without_runs() {
        let dir = tempfile::tempdir().unwrap();
        cmd_status(dir.path()).await.unwrap();
        cmd_checkpoints(dir.path()).await.unwrap();
    }
}
