//! CLI argument parsing for the requirement workflow.
//!
//! The CLI stays thin: commands parse into plain structs and route to
//! `workflow` functions that hold the actual logic.
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "reqflow",
    version,
    about = "Cross-process coordinator for requirement document folders",
    after_help = "Commands:\n  init               Create a requirement folder (metadata + doc templates)\n  list               List requirement folders, active one starred\n  set-active         Point the active marker at a requirement\n  sync-memory        Refresh the global memory snapshot in metadata\n  final-check        Review the document chain and report issues\n  subagent-init      Initialize or repair stage orchestration state\n  subagent-context   Print the handoff context for one stage\n  subagent-stage     Record a stage transition (gated and validated)\n  subagent-status    Show stage status with staleness detection\n\nExamples:\n  reqflow init --text \"Export orders to CSV\"\n  reqflow subagent-stage --stage analysis --status completed --agent writer-1\n  reqflow subagent-status --json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Emit machine-readable JSON output
    #[arg(long, global = true)]
    pub json: bool,

    /// Log what would change without writing anything
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Init(InitArgs),
    List(ListArgs),
    SetActive(SetActiveArgs),
    SyncMemory(SyncMemoryArgs),
    FinalCheck(FinalCheckArgs),
    SubagentInit(SubagentInitArgs),
    SubagentContext(SubagentContextArgs),
    SubagentStage(SubagentStageArgs),
    SubagentStatus(SubagentStatusArgs),
}

/// Requirement selector shared by every command that targets one.
#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// Requirement directory
    #[arg(long, value_name = "DIR")]
    pub path: Option<PathBuf>,

    /// Requirement name to look up across dates
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,
}

/// Create a requirement folder.
#[derive(Parser, Debug)]
#[command(about = "Create a requirement folder with metadata and doc templates")]
pub struct InitArgs {
    /// Requirement text
    #[arg(long, value_name = "TEXT", conflicts_with = "file")]
    pub text: Option<String>,

    /// Read the requirement text from a file
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Requirement title (derived from the text when omitted)
    #[arg(long, value_name = "TITLE")]
    pub title: Option<String>,

    /// Directory name (derived from title/text when omitted)
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,

    /// Date bucket, YYYY-MM-DD (today when omitted)
    #[arg(long, value_name = "DATE")]
    pub date: Option<String>,

    /// Initial clarification notes stored in metadata
    #[arg(long, value_name = "TEXT")]
    pub clarify: Option<String>,

    /// Project mode: existing or greenfield (config default when omitted)
    #[arg(long, value_name = "MODE")]
    pub project_mode: Option<String>,

    /// Write metadata only, skip the document templates
    #[arg(long)]
    pub state_only: bool,
}

#[derive(Parser, Debug)]
#[command(about = "List requirement folders")]
pub struct ListArgs {}

#[derive(Parser, Debug)]
#[command(about = "Point the active marker at a requirement")]
pub struct SetActiveArgs {
    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Parser, Debug)]
#[command(about = "Refresh the global memory snapshot in metadata")]
pub struct SyncMemoryArgs {
    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Parser, Debug)]
#[command(about = "Review the document chain and report issues")]
pub struct FinalCheckArgs {
    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Parser, Debug)]
#[command(about = "Initialize or repair stage orchestration state")]
pub struct SubagentInitArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Discard existing stage states
    #[arg(long)]
    pub reset: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Print the handoff context for one stage")]
pub struct SubagentContextArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Stage name: analysis, prd, tech, acceptance, final_check
    #[arg(long, value_name = "STAGE")]
    pub stage: String,
}

#[derive(Parser, Debug)]
#[command(about = "Record a stage transition")]
pub struct SubagentStageArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Stage name: analysis, prd, tech, acceptance, final_check
    #[arg(long, value_name = "STAGE")]
    pub stage: String,

    /// New status: pending, running, completed, failed
    #[arg(long, value_name = "STATUS")]
    pub status: String,

    /// Agent identifier recorded on the stage
    #[arg(long, value_name = "AGENT", default_value = "")]
    pub agent: String,

    /// Free-form notes recorded on the stage
    #[arg(long, value_name = "NOTES", default_value = "")]
    pub notes: String,

    /// Bypass dependency gating and output validation
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Show stage status with staleness detection")]
pub struct SubagentStatusArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Persist detected staleness as pending downgrades
    #[arg(long)]
    pub normalize: bool,
}
