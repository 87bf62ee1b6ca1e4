//! The generic instance engine: drives a flow's ordered steps, suspends on
//! waiting, resumes on signals. All coordination happens through the
//! conditional updates in [`super::store`]; the orchestrator itself holds no
//! state between calls.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::FlowError;
use crate::transaction as transaction_repo;

use super::executors::{FlowExecutorRegistry, StepOutcome, StepRuntime};
use super::store;
use super::{
    FlowInstance, FlowSnapshot, FlowStatus, FlowStepInstance, InboundSignal, StepStatus,
    correlation_satisfied, resolve_correlation,
};

/// What became of one inbound signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    /// No flow instance matched; the signal is stored for audit only.
    Orphaned { signal_id: Uuid },
    /// An instance matched but no waiting step's correlation was satisfied.
    Unmatched { signal_id: Uuid },
    Consumed { signal_id: Uuid, step_id: Uuid },
}

pub struct FlowOrchestrator {
    pool: SqlitePool,
    registry: Arc<FlowExecutorRegistry>,
}

impl FlowOrchestrator {
    pub fn new(pool: SqlitePool, registry: Arc<FlowExecutorRegistry>) -> Self {
        Self { pool, registry }
    }

    /// Idempotent: an existing instance for the transaction is resumed, a
    /// second one is never created. Otherwise snapshots the corridor's
    /// enabled definition and creates one READY step per snapshot entry.
    #[tracing::instrument(skip(self))]
    pub async fn start_flow(&self, transaction_id: Uuid) -> Result<Uuid, FlowError> {
        if let Some(instance) =
            store::find_instance_by_transaction(&self.pool, transaction_id).await?
        {
            info!(instance_id = %instance.id, "flow instance already exists, resuming");
            self.run(instance.id).await?;
            return Ok(instance.id);
        }

        let tx = transaction_repo::find(&self.pool, transaction_id)
            .await?
            .ok_or(FlowError::TransactionNotFound(transaction_id))?;
        let corridor = tx.corridor();

        let definition = store::find_enabled_definition(&self.pool, &corridor)
            .await?
            .ok_or_else(|| FlowError::DefinitionNotFound(corridor.to_string()))?;

        let mut steps = definition.steps.clone();
        steps.sort_by_key(|s| s.order);

        let snapshot = FlowSnapshot {
            definition_id: definition.id,
            corridor,
            fee_bps: definition.fee_bps,
            steps,
        };

        let instance = FlowInstance {
            id: Uuid::new_v4(),
            transaction_id,
            definition_id: definition.id,
            status: FlowStatus::InProgress,
            current_step_order: snapshot.first_order(),
            snapshot,
        };

        let step_instances: Vec<FlowStepInstance> = instance
            .snapshot
            .steps
            .iter()
            .map(|spec| FlowStepInstance {
                id: Uuid::new_v4(),
                flow_instance_id: instance.id,
                step_order: spec.order,
                step_type: spec.step_type,
                status: StepStatus::Ready,
                attempts: 0,
                correlation: spec
                    .signal_match
                    .as_ref()
                    .map(|template| resolve_correlation(template, transaction_id)),
                config: spec.config.clone(),
                input: None,
                output: None,
                error: None,
            })
            .collect();

        match store::create_instance(&self.pool, &instance, &step_instances).await {
            Ok(()) => {}
            Err(crate::error::PersistenceError::Database(sqlx::Error::Database(db)))
                if db.is_unique_violation() =>
            {
                // Another worker created the instance between our lookup and
                // insert; resume that one.
                let existing = store::find_instance_by_transaction(&self.pool, transaction_id)
                    .await?
                    .ok_or(FlowError::TransactionNotFound(transaction_id))?;
                info!(instance_id = %existing.id, "lost instance-creation race, resuming");
                self.run(existing.id).await?;
                return Ok(existing.id);
            }
            Err(e) => return Err(e.into()),
        }

        self.run(instance.id).await?;
        Ok(instance.id)
    }

    /// Claims and executes steps until the chain suspends, fails, or runs
    /// out. Safe to call from any context: every claim is conditional and
    /// losing one just returns.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, flow_instance_id: Uuid) -> Result<(), FlowError> {
        loop {
            let instance = store::find_instance(&self.pool, flow_instance_id)
                .await?
                .ok_or(FlowError::InstanceNotFound(flow_instance_id))?;

            if matches!(instance.status, FlowStatus::Completed | FlowStatus::Failed) {
                return Ok(());
            }

            let Some(order) = instance.current_step_order else {
                store::set_instance_state(&self.pool, instance.id, FlowStatus::Completed, None)
                    .await?;
                info!("flow completed");
                return Ok(());
            };

            let step = store::find_step(&self.pool, instance.id, order)
                .await?
                .ok_or(FlowError::StepNotFound {
                    instance_id: instance.id,
                    step_order: order,
                })?;

            match step.status {
                StepStatus::Succeeded => {
                    self.advance(&instance, order).await?;
                }
                StepStatus::Failed => {
                    store::set_instance_state(
                        &self.pool,
                        instance.id,
                        FlowStatus::Failed,
                        Some(order),
                    )
                    .await?;
                    return Ok(());
                }
                StepStatus::Waiting => {
                    store::set_instance_state(
                        &self.pool,
                        instance.id,
                        FlowStatus::Waiting,
                        Some(order),
                    )
                    .await?;
                    return Ok(());
                }
                StepStatus::Running => {
                    info!(step_order = order, "step already running elsewhere");
                    return Ok(());
                }
                StepStatus::Ready => {
                    if !store::claim_step(&self.pool, step.id).await? {
                        info!(step_order = order, "lost step claim, yielding");
                        return Ok(());
                    }

                    let runtime = self.build_runtime(&instance).await?;
                    store::set_step_input(
                        &self.pool,
                        step.id,
                        &serde_json::json!({ "transaction_id": runtime.transaction.id }),
                    )
                    .await?;

                    let executor = self.registry.get(step.step_type)?;
                    let outcome = match executor.execute(&step, &runtime).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(step_order = order, "step executor error: {e}");
                            StepOutcome::Failed {
                                error: e.to_string(),
                            }
                        }
                    };

                    match outcome {
                        StepOutcome::Succeeded { output } => {
                            store::complete_step(&self.pool, step.id, StepStatus::Running, &output)
                                .await?;
                            self.advance(&instance, order).await?;
                        }
                        StepOutcome::Waiting { correlation } => {
                            store::wait_step(
                                &self.pool,
                                step.id,
                                StepStatus::Running,
                                correlation.as_ref(),
                            )
                            .await?;
                            store::set_instance_state(
                                &self.pool,
                                instance.id,
                                FlowStatus::Waiting,
                                Some(order),
                            )
                            .await?;
                            return Ok(());
                        }
                        StepOutcome::Failed { error } => {
                            store::fail_step(&self.pool, step.id, StepStatus::Running, &error)
                                .await?;
                            store::set_instance_state(
                                &self.pool,
                                instance.id,
                                FlowStatus::Failed,
                                Some(order),
                            )
                            .await?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Persists the signal, matches it against the owning instance's waiting
    /// steps, and resumes the chain when the matched step succeeds. At most
    /// one step is affected per call.
    #[tracing::instrument(skip(self, signal), fields(event_type = %signal.event_type))]
    pub async fn handle_signal(
        &self,
        signal: &InboundSignal,
    ) -> Result<SignalDisposition, FlowError> {
        // Stored before any matching so even orphans leave an audit trail.
        let signal_id = store::insert_signal(&self.pool, signal).await?;

        let instance = match signal
            .correlation
            .get("transaction_id")
            .and_then(|v| Uuid::parse_str(v).ok())
        {
            Some(transaction_id) => {
                store::find_instance_by_transaction(&self.pool, transaction_id).await?
            }
            None => None,
        };

        let Some(instance) = instance else {
            warn!(%signal_id, "orphaned signal, no matching flow instance");
            return Ok(SignalDisposition::Orphaned { signal_id });
        };

        let waiting = store::waiting_steps(&self.pool, instance.id).await?;
        let Some(step) = waiting
            .into_iter()
            .find(|s| correlation_satisfied(s.correlation.as_ref(), &signal.correlation))
        else {
            info!(%signal_id, "signal matched no waiting step, stored unconsumed");
            return Ok(SignalDisposition::Unmatched { signal_id });
        };

        let executor = self.registry.get(step.step_type)?;
        let outcome = if executor.handles_signals() {
            let runtime = self.build_runtime(&instance).await?;
            match executor.on_signal(&step, &runtime, signal).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(step_order = step.step_order, "signal handler error: {e}");
                    StepOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            }
        } else {
            StepOutcome::Succeeded {
                output: serde_json::Value::Null,
            }
        };

        match outcome {
            StepOutcome::Succeeded { output } => {
                if !store::complete_step(&self.pool, step.id, StepStatus::Waiting, &output).await? {
                    info!("waiting step resolved concurrently, signal left unconsumed");
                    return Ok(SignalDisposition::Unmatched { signal_id });
                }
                store::consume_signal(&self.pool, signal_id, instance.id, step.id).await?;
                self.run(instance.id).await?;
                Ok(SignalDisposition::Consumed { signal_id, step_id: step.id })
            }
            StepOutcome::Waiting { correlation } => {
                store::wait_step(&self.pool, step.id, StepStatus::Waiting, correlation.as_ref())
                    .await?;
                store::consume_signal(&self.pool, signal_id, instance.id, step.id).await?;
                Ok(SignalDisposition::Consumed { signal_id, step_id: step.id })
            }
            StepOutcome::Failed { error } => {
                if !store::fail_step(&self.pool, step.id, StepStatus::Waiting, &error).await? {
                    return Ok(SignalDisposition::Unmatched { signal_id });
                }
                store::consume_signal(&self.pool, signal_id, instance.id, step.id).await?;
                store::set_instance_state(
                    &self.pool,
                    instance.id,
                    FlowStatus::Failed,
                    Some(step.step_order),
                )
                .await?;
                Ok(SignalDisposition::Consumed { signal_id, step_id: step.id })
            }
        }
    }

    async fn advance(&self, instance: &FlowInstance, order: i64) -> Result<(), FlowError> {
        match instance.snapshot.next_order_after(order) {
            Some(next) => {
                store::set_instance_state(
                    &self.pool,
                    instance.id,
                    FlowStatus::InProgress,
                    Some(next),
                )
                .await?;
            }
            None => {
                store::set_instance_state(&self.pool, instance.id, FlowStatus::Completed, None)
                    .await?;
                info!("flow completed");
            }
        }
        Ok(())
    }

    /// Rebuilds the step runtime from persisted state: transaction facts
    /// plus the outputs of every succeeded step.
    async fn build_runtime(&self, instance: &FlowInstance) -> Result<StepRuntime, FlowError> {
        let transaction = transaction_repo::find(&self.pool, instance.transaction_id)
            .await?
            .ok_or(FlowError::TransactionNotFound(instance.transaction_id))?;
        let prior_outputs = store::succeeded_outputs(&self.pool, instance.id).await?;

        Ok(StepRuntime {
            transaction,
            prior_outputs,
        })
    }
}
