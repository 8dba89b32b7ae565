//! Status command - show the queue of every branch

use crate::cli::context::LocalContext;
use crate::cli::style::{Stylize, pr_state, staging_state};
use anstream::println;
use mergebot::error::Result;
use mergebot::store::Store;
use std::path::Path;

/// Print PRs, the active staging and pending splits of each branch
pub fn run_status(path: &Path, branch: Option<&str>) -> Result<()> {
    let ctx = LocalContext::new(path)?;
    let store = ctx.store.as_ref();

    let branches: Vec<&str> = ctx
        .config
        .branches
        .iter()
        .map(|b| b.name.as_str())
        .filter(|b| branch.is_none_or(|wanted| wanted == *b))
        .collect();

    if branches.is_empty() {
        println!("{}", "No managed branch matches.".muted());
        return Ok(());
    }

    for name in branches {
        println!("{}", format!("Branch {name}").heading());

        match store.active_staging(name)? {
            Some(staging) => {
                println!(
                    "  staging {} {} since {}, times out at {}",
                    staging.id.emphasis(),
                    staging_state(staging.state),
                    staging.staged_at.format("%Y-%m-%d %H:%M:%S"),
                    staging.timeout_limit.format("%H:%M:%S")
                );
                for head in &staging.heads {
                    println!("    {} {}", head.repository, head.head.muted());
                }
            }
            None => println!("  {}", "no active staging".muted()),
        }

        for split in store.splits(name)? {
            println!(
                "  split {} with {} part(s): {:?}",
                split.id.emphasis(),
                split.parts.len(),
                split.parts
            );
        }

        let prs = store.search_prs(&|pr| pr.target == name && !pr.state.is_terminal())?;
        if prs.is_empty() {
            println!("  {}", "no open PRs".muted());
        }
        for pr in prs {
            let mut flags = Vec::new();
            if pr.draft {
                flags.push("draft".to_string());
            }
            if let Some(batch) = pr.batch {
                flags.push(format!("batch {batch}"));
            }
            if let Some(method) = pr.effective_merge_method() {
                flags.push(method.to_string());
            }
            println!(
                "  {} p={} {} {}",
                pr.display_name().emphasis(),
                pr.priority,
                pr_state(pr.state),
                flags.join(", ").muted()
            );
        }
    }
    Ok(())
}
