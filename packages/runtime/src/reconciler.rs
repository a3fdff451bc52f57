// ABOUTME: Serves a run's log stream and reconciles runs whose controller is gone
// ABOUTME: Live runs attach to the broadcast, zombies are failed once, finished runs replay from storage

use chrono::Utc;
use futures::stream::{self, StreamExt};
use kernel_storage::{RunRecord, RunStatus, RunStore, StorageError};
use tracing::{info, warn};

use crate::broadcast::{EventStream, StreamEvent};
use crate::error::Result;
use crate::registry::RunRegistry;

pub const INTERRUPTED_LINE: &str = "[SYSTEM] Run interrupted (server restart)";
pub const COMPLETED_LINE: &str = "[SYSTEM] Run already completed.";
pub const NOT_STARTED_LINE: &str = "[SYSTEM] Run has not started.";

/// Open a viewer stream for `run_id`.
///
/// Fails with `StorageError::NotFound` only when the run is neither live nor stored.
pub async fn open_stream(
    runs: &dyn RunStore,
    registry: &RunRegistry,
    run_id: &str,
) -> Result<EventStream> {
    if let Some(live) = registry.get(run_id).await {
        return Ok(live.broadcast.subscribe().into_stream());
    }

    let mut record = runs.get_run(run_id).await?;

    if !record.is_terminal() {
        // The run may have been registered between the two lookups
        if let Some(live) = registry.get(run_id).await {
            return Ok(live.broadcast.subscribe().into_stream());
        }
        if record.status == RunStatus::Running {
            record = interrupt(runs, record).await?.0;
        }
    }

    Ok(replay(&record))
}

/// Fail every unfinished run that no lifecycle in this process controls.
pub async fn sweep(runs: &dyn RunStore, registry: &RunRegistry) -> Result<usize> {
    let mut reconciled = 0;
    for record in runs.list_unfinished_runs().await? {
        if registry.contains(&record.id).await {
            continue;
        }
        let run_id = record.id.clone();
        match interrupt(runs, record).await {
            Ok((_, true)) => reconciled += 1,
            Ok((_, false)) => {}
            Err(e) => warn!(run_id = %run_id, "Failed to reconcile orphaned run: {}", e),
        }
    }

    if reconciled > 0 {
        info!("Reconciled {} orphaned runs", reconciled);
    }
    Ok(reconciled)
}

/// Mark a run interrupted. The store refuses commits to terminal records, so when
/// two viewers race only one interruption line is ever written.
///
/// Returns the stored record and whether this call performed the transition.
async fn interrupt(runs: &dyn RunStore, record: RunRecord) -> Result<(RunRecord, bool)> {
    let mut updated = record;
    updated.status = RunStatus::Error;
    updated.end_time = Some(Utc::now());
    if !updated.logs.is_empty() && !updated.logs.ends_with('\n') {
        updated.append_logs("\n");
    }
    updated.append_logs(INTERRUPTED_LINE);
    updated.append_logs("\n");

    match runs.commit_run(&updated).await {
        Ok(()) => {
            warn!(run_id = %updated.id, "Run had no live controller, marked as interrupted");
            Ok((updated, true))
        }
        Err(StorageError::TerminalRun(_)) => Ok((runs.get_run(&updated.id).await?, false)),
        Err(e) => Err(e.into()),
    }
}

/// One-shot replay of a stored transcript followed by the completion marker.
/// Queued records with no controller have not run yet; only terminal ones are complete.
fn replay_trailer(record: &RunRecord) -> &'static str {
    if record.is_terminal() {
        COMPLETED_LINE
    } else {
        NOT_STARTED_LINE
    }
}

fn replay(record: &RunRecord) -> EventStream {
    let events: Vec<StreamEvent> = record
        .logs
        .lines()
        .map(|line| StreamEvent::Line(line.to_string()))
        .chain([
            StreamEvent::Line(replay_trailer(record).to_string()),
            StreamEvent::Complete,
        ])
        .collect();

    stream::iter(events).boxed()
}
