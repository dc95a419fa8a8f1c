use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use forge_agents::{check_endpoint, AgentConfig, BasicInsightExtractor, BasicPromptGenerator, RigAgentClient};
use forge_core::coder_loop::{default_memory_store, BuildOutcome, CoderLoop, TokioClock};
use forge_core::recovery::RecoveryManager;
use forge_core::worktree::WorktreeManager;

const BUILD_DIR: &str = ".auto-claude";

/// Drive one spec's implementation plan to completion in an isolated
/// worktree, then merge the result back.
#[derive(Parser, Debug)]
#[command(name = "forge-agents")]
struct Cli {
    /// Spec name (matches .auto-claude/specs/<name>/implementation_plan.json)
    spec_name: String,

    /// Project root containing .auto-claude/ (defaults to the current directory)
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    /// Merge the worktree back into the base branch once the plan completes
    #[arg(long)]
    merge: bool,

    /// Delete the worktree and branch after a successful merge
    #[arg(long)]
    delete_after_merge: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let project_root = cli
        .project_root
        .canonicalize()
        .with_context(|| format!("project root not found: {}", cli.project_root.display()))?;

    let agent_config = AgentConfig::default();
    anyhow::ensure!(
        check_endpoint(&agent_config.url, &agent_config.api_key, Some(&agent_config.model)).await,
        "inference endpoint {} is unreachable or missing model {}",
        agent_config.url,
        agent_config.model
    );

    let mut worktrees = WorktreeManager::new(project_root.clone(), BUILD_DIR);
    if let Some(base) = agent_config.worktree_base.clone() {
        worktrees = worktrees.with_worktree_base(base);
    }
    let info = worktrees
        .create(&cli.spec_name, false)
        .context("failed to create or reuse worktree")?;
    tracing::info!(branch = %info.branch, path = %info.path.display(), "worktree ready");

    let spec_dir = project_root.join(BUILD_DIR).join("specs").join(&cli.spec_name);
    anyhow::ensure!(
        spec_dir.join("implementation_plan.json").exists(),
        "no implementation_plan.json under {} — the plan engine runs ahead of this CLI",
        spec_dir.display()
    );

    let client = RigAgentClient::new(&agent_config)?;
    let prompts = BasicPromptGenerator;
    let insights = BasicInsightExtractor;
    let memory = default_memory_store(&spec_dir);
    let clock = TokioClock;
    let session_id = uuid_like_session_id();

    let mut recovery = RecoveryManager::new(project_root.clone(), spec_dir.join("recovery"));
    let coder_loop = CoderLoop::new(
        &client,
        &prompts,
        &insights,
        &memory,
        &clock,
        project_root.clone(),
        spec_dir,
        session_id,
    );

    match coder_loop.run(&mut recovery).await? {
        BuildOutcome::Complete => {
            tracing::info!("plan complete");
            if cli.merge {
                worktrees
                    .merge_worktree(&cli.spec_name, cli.delete_after_merge, false)
                    .context("merge failed")?;
                tracing::info!("merged into base branch");
            }
        }
        BuildOutcome::AllRemainingStuck => {
            tracing::warn!("all remaining subtasks are stuck; human intervention needed");
            std::process::exit(1);
        }
        BuildOutcome::Paused => {
            tracing::info!("build paused (PAUSE file present)");
        }
    }

    Ok(())
}

/// A session id unique enough to tell ledger entries apart across runs,
/// without pulling in a UUID dependency this crate otherwise has no use for.
fn uuid_like_session_id() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("sess-{}-{}", now.as_secs(), now.subsec_nanos())
}
