use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db;
use crate::filter;
use crate::models::{Comparator, GroupDefinition, GroupRunFailure, GroupRunResult, RunReport};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a recomputation run is already in progress")]
    RunInProgress,
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("evaluation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Recompute every group's membership from the stored incident history.
///
/// A second trigger while a run is in progress is rejected rather than
/// queued; concurrent runs would clear and rebuild the same membership
/// rows against divergent views of "now".
pub async fn run(pool: &PgPool) -> Result<RunReport, EngineError> {
    let Some(lock) = db::try_acquire_run_lock(pool).await? else {
        return Err(EngineError::RunInProgress);
    };

    let outcome = run_locked(pool).await;
    if let Err(err) = lock.release().await {
        warn!("failed to release run lock: {err}");
    }
    outcome
}

async fn run_locked(pool: &PgPool) -> Result<RunReport, EngineError> {
    // One "now" for every group keeps all windows comparable within the run.
    let run_at = Utc::now();
    let definitions = db::list_group_definitions(pool).await?;
    info!(groups = definitions.len(), "starting membership recomputation");

    // Evaluation only reads the store, so groups are scored in parallel;
    // nothing is written until every group's new membership is known.
    let mut tasks = JoinSet::new();
    for definition in definitions {
        let pool = pool.clone();
        tasks.spawn(async move {
            let outcome = evaluate_group(&pool, &definition, run_at).await;
            (definition, outcome)
        });
    }

    let mut evaluated = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        evaluated.push(joined?);
    }
    evaluated.sort_by(|a, b| a.0.name.cmp(&b.0.name));

    let mut groups = Vec::new();
    let mut failures = Vec::new();
    for (definition, outcome) in evaluated {
        match outcome {
            Ok(result) => {
                match db::commit_group_run(pool, definition.id, &result.matches, run_at).await {
                    Ok(()) => {
                        info!(
                            group = %definition.name,
                            matched = result.matches.len(),
                            "membership replaced"
                        );
                        groups.push(result);
                    }
                    Err(err) => {
                        error!(
                            group = %definition.name,
                            "commit failed, prior membership kept: {err}"
                        );
                        failures.push(GroupRunFailure {
                            group_id: definition.id,
                            group_name: definition.name,
                            error: err.to_string(),
                        });
                    }
                }
            }
            Err(err) => {
                error!(group = %definition.name, "evaluation failed, group skipped: {err}");
                failures.push(GroupRunFailure {
                    group_id: definition.id,
                    group_name: definition.name,
                    error: err.to_string(),
                });
            }
        }
    }

    info!(
        recomputed = groups.len(),
        failed = failures.len(),
        "membership recomputation finished"
    );
    Ok(RunReport {
        run_at,
        groups,
        failures,
    })
}

/// Score one group against the incident history. Reads the store but
/// writes nothing. A misconfigured definition yields an empty match
/// list so the commit phase still empties its membership and stamps
/// its metadata at zero.
async fn evaluate_group(
    pool: &PgPool,
    definition: &GroupDefinition,
    now: DateTime<Utc>,
) -> Result<GroupRunResult, sqlx::Error> {
    let rule = match definition.rule() {
        Ok(rule) => rule,
        Err(reason) => {
            warn!(group = %definition.name, %reason, "group can never match");
            return Ok(GroupRunResult {
                group_id: definition.id,
                group_name: definition.name.clone(),
                comparator: Comparator::parse(&definition.comparator),
                incident_threshold: definition.incident_threshold,
                matches: Vec::new(),
                config_warning: Some(reason.to_string()),
            });
        }
    };

    let cutoff = filter::window_cutoff(now, rule.window_weeks);
    let roll_ids = db::rolls_completed_on_or_after(pool, cutoff).await?;
    let in_window: HashSet<Uuid> = roll_ids.iter().copied().collect();
    let events = db::roll_states_for_rolls(pool, &roll_ids).await?;
    let matches = filter::evaluate_rule(&rule, &in_window, &events);

    Ok(GroupRunResult {
        group_id: definition.id,
        group_name: definition.name.clone(),
        comparator: Some(rule.comparator),
        incident_threshold: definition.incident_threshold,
        matches,
        config_warning: None,
    })
}
