use crate::output::{print_json, print_table};
use anyhow::Context;
use cbc_core::workflow::{Run, RunDb, RunStatus, StepOutcome};
use cbc_core::{paths, CbcError};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum RunsSubcommand {
    /// List runs, newest first
    List {
        /// Only show runs with this status (pending, running, succeeded, failed)
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one run with its step history
    Show {
        /// Run id or a unique prefix of it
        id: String,
    },
}

pub fn run(root: &Path, subcmd: RunsSubcommand, json: bool) -> anyhow::Result<()> {
    // Read-only: open the database directly so no credentials are needed.
    if !paths::cbc_dir(root).is_dir() {
        return Err(CbcError::NotInitialized.into());
    }
    let db = RunDb::open(&paths::runs_db_path(root)).context("failed to open runs.db")?;
    match subcmd {
        RunsSubcommand::List { status } => list(&db, status.as_deref(), json),
        RunsSubcommand::Show { id } => show(&db, &id, json),
    }
}

fn list(db: &RunDb, status: Option<&str>, json: bool) -> anyhow::Result<()> {
    let runs: Vec<Run> = db
        .list_all()?
        .into_iter()
        .filter(|r| status.is_none_or(|s| r.status.label() == s))
        .collect();

    if json {
        return print_json(&runs);
    }
    let rows = runs
        .iter()
        .map(|r| {
            vec![
                short_id(r),
                r.status.label().to_string(),
                r.state.clone(),
                r.event.config_rule_name.clone(),
                r.event.resource_id.clone(),
                r.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    print_table(
        &["ID", "STATUS", "STATE", "RULE", "RESOURCE", "CREATED"],
        rows,
        "No runs.",
    );
    Ok(())
}

fn show(db: &RunDb, id: &str, json: bool) -> anyhow::Result<()> {
    let run = db.find(id)?;
    if json {
        print_json(&run)
    } else {
        print_run(&run);
        Ok(())
    }
}

fn short_id(run: &Run) -> String {
    run.id.to_string()[..8].to_string()
}

pub fn print_run(run: &Run) {
    println!("Run:       {}", run.id);
    println!("Rule:      {}", run.event.config_rule_name);
    println!(
        "Resource:  {} {}",
        run.event.resource_type, run.event.resource_id
    );
    println!("State:     {}", run.state);
    match &run.status {
        RunStatus::Failed { error, cause } => println!("Status:    failed ({error}: {cause})"),
        RunStatus::Pending => println!(
            "Status:    pending until {}",
            run.next_tick_at.format("%Y-%m-%d %H:%M:%S%.3f")
        ),
        other => println!("Status:    {}", other.label()),
    }
    if let Some(verdict) = run.context.verdict {
        println!("Verdict:   {}", if verdict { "compliant" } else { "non-compliant" });
    }
    if let Some(locator) = &run.context.report_locator {
        println!("Report:    {locator}");
    }

    if run.history.is_empty() {
        return;
    }
    println!();
    let rows = run
        .history
        .iter()
        .map(|s| {
            let outcome = match &s.outcome {
                StepOutcome::Completed => "completed".to_string(),
                StepOutcome::Retrying { error, retry_at } => {
                    format!("retry at {} ({error})", retry_at.format("%H:%M:%S%.3f"))
                }
                StepOutcome::Caught { error, next } => format!("caught {error} -> {next}"),
                StepOutcome::Failed { error } => format!("failed ({error})"),
            };
            vec![
                s.state.clone(),
                s.attempt.to_string(),
                s.started_at.format("%H:%M:%S%.3f").to_string(),
                outcome,
            ]
        })
        .collect();
    print_table(&["STATE", "ATTEMPT", "STARTED", "OUTCOME"], rows, "");
}
