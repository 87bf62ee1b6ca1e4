//! The generic step-workflow engine: corridor flow definitions, per-
//! transaction instances with immutable snapshots, step instances, and the
//! signal records that resume suspended steps.

pub mod executors;
pub mod orchestrator;
pub mod store;

pub use executors::{
    FlowExecutorRegistry, StepExecutor, StepOutcome, StepRuntime,
};
pub use orchestrator::{FlowOrchestrator, SignalDisposition};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::Corridor;
use crate::string_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    InProgress,
    Waiting,
    Completed,
    Failed,
}

string_enum!(FlowStatus, "flow status", {
    InProgress => "IN_PROGRESS",
    Waiting => "WAITING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Ready,
    Running,
    Waiting,
    Succeeded,
    Failed,
}

string_enum!(StepStatus, "step status", {
    Ready => "READY",
    Running => "RUNNING",
    Waiting => "WAITING",
    Succeeded => "SUCCEEDED",
    Failed => "FAILED",
});

/// The closed set of step types the engine knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ExchangeTransfer,
    PayoutTrigger,
    PartnerNotice,
}

string_enum!(StepType, "step type", {
    ExchangeTransfer => "exchange_transfer",
    PayoutTrigger => "payout_trigger",
    PartnerNotice => "partner_notice",
});

/// Whether a step concludes inline or suspends until a matching signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    #[default]
    Auto,
    AwaitSignal,
}

/// One step of a corridor template. `signal_match` is a correlation
/// template; `$transaction_id` in its values is substituted when the step
/// instance is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_type: StepType,
    pub order: i64,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub completion: CompletionPolicy,
    #[serde(default)]
    pub signal_match: Option<BTreeMap<String, String>>,
}

/// Immutable corridor template. Looked up by corridor at flow start; a
/// running instance only ever sees its own snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDefinition {
    pub id: Uuid,
    pub corridor: Corridor,
    pub fee_bps: i64,
    pub enabled: bool,
    pub steps: Vec<StepSpec>,
}

/// What a FlowInstance captures of its definition at creation time. Later
/// edits to the definition never affect a running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub definition_id: Uuid,
    pub corridor: Corridor,
    pub fee_bps: i64,
    pub steps: Vec<StepSpec>,
}

impl FlowSnapshot {
    /// The smallest step order greater than `order`, if any.
    pub fn next_order_after(&self, order: i64) -> Option<i64> {
        self.steps
            .iter()
            .map(|s| s.order)
            .filter(|o| *o > order)
            .min()
    }

    pub fn first_order(&self) -> Option<i64> {
        self.steps.iter().map(|s| s.order).min()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowInstance {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub definition_id: Uuid,
    pub status: FlowStatus,
    pub current_step_order: Option<i64>,
    pub snapshot: FlowSnapshot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowStepInstance {
    pub id: Uuid,
    pub flow_instance_id: Uuid,
    pub step_order: i64,
    pub step_type: StepType,
    pub status: StepStatus,
    pub attempts: i64,
    /// Key→value equals-matches an inbound signal must satisfy to resume
    /// this step.
    pub correlation: Option<BTreeMap<String, String>>,
    pub config: serde_json::Value,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// An inbound event as carried on the signal queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundSignal {
    pub event_type: String,
    pub correlation: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// True when every stored correlation key equals the corresponding signal
/// value. Extra signal keys are ignored; an absent bag matches vacuously.
pub fn correlation_satisfied(
    stored: Option<&BTreeMap<String, String>>,
    signal: &BTreeMap<String, String>,
) -> bool {
    stored
        .map(|bag| bag.iter().all(|(k, v)| signal.get(k) == Some(v)))
        .unwrap_or(true)
}

/// Resolves a signal-match template against the owning transaction.
pub fn resolve_correlation(
    template: &BTreeMap<String, String>,
    transaction_id: Uuid,
) -> BTreeMap<String, String> {
    template
        .iter()
        .map(|(k, v)| {
            let resolved = v.replace("$transaction_id", &transaction_id.to_string());
            (k.clone(), resolved)
        })
        .collect()
}
