use super::open_session;
use crate::Context;
use crate::cli::ChainsCommand;
use crate::ui;
use anyhow::Result;
use colored::Colorize;
use installkit::{ChainStatus, RemediationChain};

pub fn run(ctx: &Context, cmd: ChainsCommand) -> Result<()> {
    let session = open_session(ctx)?;
    match cmd {
        ChainsCommand::List => {
            let chains = session.chains().list()?;
            if chains.is_empty() {
                ui::info("No remediation chains");
                return Ok(());
            }
            ui::header("Remediation Chains");
            for chain in &chains {
                println!(
                    "  {:<36} {:<16} {:<16} depth {}",
                    ui::truncate(&chain.chain_id, 36),
                    ui::truncate(&chain.original_goal.tool_id, 16),
                    status_label(chain.status),
                    chain.depth()
                );
            }
            Ok(())
        }
        ChainsCommand::Show { id } => {
            let chain = session.chains().get(&id)?;
            show(&chain);
            Ok(())
        }
    }
}

fn show(chain: &RemediationChain) {
    ui::header(&format!("Chain {}", chain.chain_id));
    ui::kv("Goal", &chain.original_goal.tool_id);
    ui::kv("Status", &status_label(chain.status));
    ui::kv(
        "Depth",
        &format!("{} of {}", chain.depth(), chain.max_depth),
    );
    ui::kv("Updated", &chain.updated_at.to_rfc3339());

    ui::section("Path");
    for crumb in chain.breadcrumbs() {
        println!("  {}{}", "  ".repeat(crumb.depth), crumb);
    }
}

fn status_label(status: ChainStatus) -> String {
    let text = status.to_string();
    match status {
        ChainStatus::Done | ChainStatus::ReadyToRetry => text.green().to_string(),
        ChainStatus::Failed => text.red().to_string(),
        ChainStatus::Cancelled => text.dimmed().to_string(),
        _ => text.yellow().to_string(),
    }
}
