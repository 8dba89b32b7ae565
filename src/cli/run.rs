//! Scheduler commands: single tick, loop, and maintenance

use crate::cli::context::CommandContext;
use crate::cli::style::{Stylize, check, cross, staging_state};
use anstream::println;
use mergebot::auth::test_github_auth;
use mergebot::engine::{Engine, TickReport};
use mergebot::error::Result;
use mergebot::types::StagingState;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info};

fn print_report(report: &TickReport) {
    for (id, state) in &report.stagings_finished {
        let mark = if *state == StagingState::Success { check() } else { cross() };
        println!("{mark} staging {} {}", id.emphasis(), staging_state(*state));
    }
    for id in &report.stagings_created {
        println!("{} created staging {}", check(), id.emphasis());
    }
    println!(
        "{}",
        format!(
            "{} commit(s) checked, {} feedback item(s) sent",
            report.commits_checked, report.feedback_sent
        )
        .muted()
    );
}

/// Run one tick and print what happened
pub async fn run_tick(path: &Path) -> Result<()> {
    let ctx = CommandContext::new(path).await?;
    let report = ctx.engine.tick().await?;
    print_report(&report);
    Ok(())
}

async fn maintenance(engine: &Engine) {
    match engine.maintenance().await {
        Ok(n) => info!(repositories = n, "maintenance done"),
        Err(e) => error!(error = %e, "maintenance failed"),
    }
}

/// Tick every `interval` seconds until interrupted
///
/// Credentials are checked once up front. A failed tick is logged and the
/// loop carries on.
pub async fn run_loop(path: &Path, interval: u64, gc_every: u64) -> Result<()> {
    let ctx = CommandContext::new(path).await?;
    let config = &ctx.local.config;
    if let (Some(repository), Some(branch)) =
        (config.repositories.first(), config.active_branches().next())
    {
        let head = test_github_auth(ctx.engine.remote(), &repository.name, branch).await?;
        debug!(repository = %repository.name, branch, head, "credentials checked");
    }

    let mut timer = tokio::time::interval(Duration::from_secs(interval.max(1)));
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticks: u64 = 0;

    info!(project = %ctx.local.config.project.name, interval, "starting");
    loop {
        tokio::select! {
            _ = timer.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping");
                return Ok(());
            }
        }

        match ctx.engine.tick().await {
            Ok(report) if report != TickReport::default() => info!(?report, "tick"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "tick failed"),
        }

        ticks += 1;
        if gc_every > 0 && ticks % gc_every == 0 {
            maintenance(&ctx.engine).await;
        }
    }
}

/// Garbage-collect every cached mirror
pub async fn run_gc(path: &Path) -> Result<()> {
    let ctx = CommandContext::new(path).await?;
    let n = ctx.engine.maintenance().await?;
    println!("{} collected {} mirror(s)", check(), n.emphasis());
    Ok(())
}

/// Delete scratch branches left over by deactivated branches
pub async fn run_cleanup(path: &Path) -> Result<()> {
    let ctx = CommandContext::new(path).await?;
    let n = ctx.engine.cleanup_scratch_branches().await?;
    println!("{} deleted {} scratch branch(es)", check(), n.emphasis());
    Ok(())
}
