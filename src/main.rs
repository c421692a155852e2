use anyhow::Result;
use clap::Parser;

mod cli;
mod config;
mod docs;
mod error;
mod lockfile;
mod metadata;
mod orchestrator;
mod output;
mod requirement;
mod review;
mod signature;
mod stage;
mod util;
mod workflow;

use cli::{Command, RootArgs};
use workflow::CommandContext;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = RootArgs::parse();
    let json = args.json;
    if let Err(err) = run(args) {
        if json {
            let payload = serde_json::json!({
                "ok": false,
                "kind": error::error_kind(&err),
                "error": format!("{err:#}"),
            });
            println!("{payload}");
        } else {
            eprintln!("error: {err:#}");
        }
        std::process::exit(1);
    }
}

fn run(args: RootArgs) -> Result<()> {
    let config = config::load_config()?;
    let ctx = CommandContext {
        json: args.json,
        dry_run: args.dry_run || config.dry_run_default,
        config,
    };
    match &args.command {
        Command::Init(cmd) => workflow::run_init(&ctx, cmd),
        Command::List(cmd) => workflow::run_list(&ctx, cmd),
        Command::SetActive(cmd) => workflow::run_set_active(&ctx, cmd),
        Command::SyncMemory(cmd) => workflow::run_sync_memory(&ctx, cmd),
        Command::FinalCheck(cmd) => workflow::run_final_check(&ctx, cmd),
        Command::SubagentInit(cmd) => workflow::run_subagent_init(&ctx, cmd),
        Command::SubagentContext(cmd) => workflow::run_subagent_context(&ctx, cmd),
        Command::SubagentStage(cmd) => workflow::run_subagent_stage(&ctx, cmd),
        Command::SubagentStatus(cmd) => workflow::run_subagent_status(&ctx, cmd),
    }
}
