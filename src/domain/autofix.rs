//! Bounded repair loop.
//!
//! Each attempt asks the translator for a revised document, then validates,
//! compiles and executes it. The loop ends on the first successful
//! execution, when `max_attempts` attempts have been made, or when a revision
//! compiles to the same artifact hash as the previous one.

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::compiler::{compile, CompiledArtifact};
use crate::domain::content_hash::ContentHash;
use crate::domain::dsl::DslDocument;
use crate::domain::error::{
    ExecutionError, ExhaustedRetries, ExhaustionReason, StageFailure, TranslationError,
};
use crate::domain::execution_result::RawExecutionLog;
use crate::domain::pipeline::RunState;
use crate::domain::validator::validate;

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { failure: StageFailure },
    /// The revision compiled to the previous artifact.
    NoProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairAttempt {
    /// 1-based.
    pub index: usize,
    pub trigger: StageFailure,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dsl: Option<DslDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_hash: Option<ContentHash>,
    pub outcome: AttemptOutcome,
}

/// The effectful half of a repair attempt, supplied by the pipeline.
#[async_trait]
pub trait RepairSteps: Send + Sync {
    async fn revise(
        &self,
        prior_dsl: Option<&DslDocument>,
        prior_artifact: Option<&CompiledArtifact>,
        failure: &StageFailure,
    ) -> Result<DslDocument, TranslationError>;

    async fn execute(&self, artifact: &CompiledArtifact) -> Result<RawExecutionLog, ExecutionError>;

    /// Called on every state transition inside the loop.
    fn on_state(&self, _state: RunState) {}
}

/// A successful repair.
#[derive(Debug, Clone)]
pub struct Repaired {
    pub dsl: DslDocument,
    pub artifact: CompiledArtifact,
    pub log: RawExecutionLog,
    pub attempts: Vec<RepairAttempt>,
}

#[derive(Debug, Clone, Copy)]
pub struct AutoFixController {
    max_attempts: usize,
}

impl AutoFixController {
    pub fn new(max_attempts: usize) -> Self {
        Self { max_attempts }
    }

    /// Repair a document whose artifact failed to execute.
    pub async fn run<S: RepairSteps + ?Sized>(
        &self,
        steps: &S,
        dsl: DslDocument,
        artifact: CompiledArtifact,
        failure: ExecutionError,
    ) -> Result<Repaired, ExhaustedRetries> {
        let mut attempts: Vec<RepairAttempt> = Vec::new();
        let mut last_compiled = artifact.clone();
        let mut prior_dsl = Some(dsl);
        let mut prior_artifact = Some(artifact);
        let mut trigger = StageFailure::Execution(failure);

        while attempts.len() < self.max_attempts {
            let index = attempts.len() + 1;
            steps.on_state(RunState::Repairing);
            tracing::warn!(
                attempt = index,
                max = self.max_attempts,
                category = trigger.category(),
                error = %trigger,
                "starting repair attempt"
            );

            steps.on_state(RunState::Translating);
            let revised = match steps
                .revise(prior_dsl.as_ref(), prior_artifact.as_ref(), &trigger)
                .await
            {
                Ok(doc) => doc,
                Err(e) => {
                    let failure = StageFailure::Translation(e);
                    tracing::warn!(attempt = index, error = %failure, "repair translation failed");
                    attempts.push(RepairAttempt {
                        index,
                        trigger,
                        dsl: None,
                        artifact_hash: None,
                        outcome: AttemptOutcome::Failed {
                            failure: failure.clone(),
                        },
                    });
                    trigger = failure;
                    continue;
                }
            };

            steps.on_state(RunState::Validating);
            let validated = match validate(&revised) {
                Ok(v) => v,
                Err(e) => {
                    let failure = StageFailure::Validation(e);
                    tracing::warn!(attempt = index, error = %failure, "repaired document is invalid");
                    attempts.push(RepairAttempt {
                        index,
                        trigger,
                        dsl: Some(revised.clone()),
                        artifact_hash: None,
                        outcome: AttemptOutcome::Failed {
                            failure: failure.clone(),
                        },
                    });
                    prior_dsl = Some(revised);
                    prior_artifact = None;
                    trigger = failure;
                    continue;
                }
            };

            steps.on_state(RunState::Compiling);
            let compiled = match compile(&validated) {
                Ok(a) => a,
                Err(e) => {
                    let failure = StageFailure::Compilation(e);
                    tracing::warn!(attempt = index, error = %failure, "repaired document did not compile");
                    attempts.push(RepairAttempt {
                        index,
                        trigger,
                        dsl: Some(revised.clone()),
                        artifact_hash: None,
                        outcome: AttemptOutcome::Failed {
                            failure: failure.clone(),
                        },
                    });
                    prior_dsl = Some(revised);
                    prior_artifact = None;
                    trigger = failure;
                    continue;
                }
            };

            if compiled.hash == last_compiled.hash {
                tracing::warn!(
                    attempt = index,
                    artifact = compiled.hash.short(),
                    "repair produced an identical artifact, stopping"
                );
                attempts.push(RepairAttempt {
                    index,
                    trigger: trigger.clone(),
                    dsl: Some(revised),
                    artifact_hash: Some(compiled.hash.clone()),
                    outcome: AttemptOutcome::NoProgress,
                });
                return Err(ExhaustedRetries {
                    reason: ExhaustionReason::NoProgress,
                    attempts,
                    last_failure: trigger,
                    last_artifact: compiled,
                });
            }
            last_compiled = compiled.clone();
            tracing::debug!(attempt = index, artifact = compiled.hash.short(), "repaired artifact compiled");

            steps.on_state(RunState::Executing);
            match steps.execute(&compiled).await {
                Ok(log) => {
                    tracing::info!(attempt = index, "repair attempt succeeded");
                    attempts.push(RepairAttempt {
                        index,
                        trigger,
                        dsl: Some(revised.clone()),
                        artifact_hash: Some(compiled.hash.clone()),
                        outcome: AttemptOutcome::Succeeded,
                    });
                    return Ok(Repaired {
                        dsl: revised,
                        artifact: compiled,
                        log,
                        attempts,
                    });
                }
                Err(e) => {
                    let failure = StageFailure::Execution(e);
                    tracing::warn!(attempt = index, error = %failure, "repaired artifact failed");
                    attempts.push(RepairAttempt {
                        index,
                        trigger,
                        dsl: Some(revised.clone()),
                        artifact_hash: Some(compiled.hash.clone()),
                        outcome: AttemptOutcome::Failed {
                            failure: failure.clone(),
                        },
                    });
                    prior_dsl = Some(revised);
                    prior_artifact = Some(compiled);
                    trigger = failure;
                }
            }
        }

        Err(ExhaustedRetries {
            reason: ExhaustionReason::BudgetExhausted,
            attempts,
            last_failure: trigger,
            last_artifact: last_compiled,
        })
    }
}
