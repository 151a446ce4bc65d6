use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::auth::{Decision, SemaphoreLevel};
use crate::monitor::{Anomaly as AnomalyRecord, AnomalyType, SystemMetrics};
use crate::plan::{RiskLevel, SandboxMode};
use crate::types::{CircuitState, Severity};

/// Events published by Aurora and the Operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    // ── Aurora ─────────────────────────────────────────────────
    Health {
        metrics: SystemMetrics,
        health_score: u8,
    },
    Alert {
        metric: String,
        value: f64,
        threshold: f64,
        severity: Severity,
        message: String,
    },
    Limit {
        plan_id: Option<Uuid>,
        resource: String,
        used: f64,
        limit: f64,
    },
    Pause {
        plan_id: Uuid,
        reason: String,
    },
    Cut {
        plan_id: Uuid,
        reason: String,
        checkpoint_id: Uuid,
        can_resume: bool,
        can_rollback: bool,
    },
    Resume {
        plan_id: Uuid,
        reason: String,
    },
    CircuitBreaker {
        target: String,
        from: CircuitState,
        to: CircuitState,
        reason: String,
        retry_after_ms: u64,
    },
    Anomaly {
        anomaly: AnomalyRecord,
    },
    AutoHeal {
        anomaly_type: AnomalyType,
        actions: Vec<String>,
        success: bool,
        message: String,
    },

    // ── Operator ───────────────────────────────────────────────
    IntentReceived {
        intent_id: Uuid,
        intent_type: String,
        channel: String,
    },
    PlanCreated {
        plan_id: Uuid,
        steps: usize,
        risk_level: RiskLevel,
    },
    AuthorizationRequested {
        request_id: Uuid,
        plan_id: Uuid,
    },
    AuthorizationDecided {
        request_id: Uuid,
        plan_id: Uuid,
        decision: Decision,
        risk_score: u8,
        level: SemaphoreLevel,
    },
    ConfirmationRequired {
        request_id: Uuid,
        plan_id: Uuid,
        prompt: String,
    },
    ExecutionStarted {
        plan_id: Uuid,
        mode: SandboxMode,
    },
    StepStarted {
        plan_id: Uuid,
        step_id: String,
        attempt: u32,
    },
    StepCompleted {
        plan_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },
    StepRetrying {
        plan_id: Uuid,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepFailed {
        plan_id: Uuid,
        step_id: String,
        error: String,
    },
    StepSkipped {
        plan_id: Uuid,
        step_id: String,
        reason: String,
        /// The step's target circuit was open; nothing was dispatched.
        #[serde(default)]
        circuit_open: bool,
    },
    CheckpointCreated {
        plan_id: Uuid,
        checkpoint_id: Uuid,
        reason: String,
    },
    ExecutionPaused {
        plan_id: Uuid,
        checkpoint_id: Option<Uuid>,
    },
    ExecutionResumed {
        plan_id: Uuid,
    },
    ExecutionCompleted {
        plan_id: Uuid,
        duration_ms: u64,
    },
    ExecutionFailed {
        plan_id: Uuid,
        step_id: Option<String>,
        error: String,
    },
    ExecutionCancelled {
        plan_id: Uuid,
    },
    RollbackStarted {
        plan_id: Uuid,
        steps: usize,
    },
    RollbackCompleted {
        plan_id: Uuid,
        rolled_back: usize,
        failed: usize,
    },
}

impl Event {
    /// Wire name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Health { .. } => "HEALTH",
            Self::Alert { .. } => "ALERT",
            Self::Limit { .. } => "LIMIT",
            Self::Pause { .. } => "PAUSE",
            Self::Cut { .. } => "CUT",
            Self::Resume { .. } => "RESUME",
            Self::CircuitBreaker { .. } => "CIRCUIT_BREAKER",
            Self::Anomaly { .. } => "ANOMALY",
            Self::AutoHeal { .. } => "AUTO_HEAL",
            Self::IntentReceived { .. } => "INTENT_RECEIVED",
            Self::PlanCreated { .. } => "PLAN_CREATED",
            Self::AuthorizationRequested { .. } => "AUTHORIZATION_REQUESTED",
            Self::AuthorizationDecided { .. } => "AUTHORIZATION_DECIDED",
            Self::ConfirmationRequired { .. } => "CONFIRMATION_REQUIRED",
            Self::ExecutionStarted { .. } => "EXECUTION_STARTED",
            Self::StepStarted { .. } => "STEP_STARTED",
            Self::StepCompleted { .. } => "STEP_COMPLETED",
            Self::StepRetrying { .. } => "STEP_RETRYING",
            Self::StepFailed { .. } => "STEP_FAILED",
            Self::StepSkipped { .. } => "STEP_SKIPPED",
            Self::CheckpointCreated { .. } => "CHECKPOINT_CREATED",
            Self::ExecutionPaused { .. } => "EXECUTION_PAUSED",
            Self::ExecutionResumed { .. } => "EXECUTION_RESUMED",
            Self::ExecutionCompleted { .. } => "EXECUTION_COMPLETED",
            Self::ExecutionFailed { .. } => "EXECUTION_FAILED",
            Self::ExecutionCancelled { .. } => "EXECUTION_CANCELLED",
            Self::RollbackStarted { .. } => "ROLLBACK_STARTED",
            Self::RollbackCompleted { .. } => "ROLLBACK_COMPLETED",
        }
    }

    /// Plan the event concerns, if any.
    pub fn plan_id(&self) -> Option<Uuid> {
        match self {
            Self::Limit { plan_id, .. } => *plan_id,
            Self::Pause { plan_id, .. }
            | Self::Cut { plan_id, .. }
            | Self::Resume { plan_id, .. }
            | Self::PlanCreated { plan_id, .. }
            | Self::AuthorizationRequested { plan_id, .. }
            | Self::AuthorizationDecided { plan_id, .. }
            | Self::ConfirmationRequired { plan_id, .. }
            | Self::ExecutionStarted { plan_id, .. }
            | Self::StepStarted { plan_id, .. }
            | Self::StepCompleted { plan_id, .. }
            | Self::StepRetrying { plan_id, .. }
            | Self::StepFailed { plan_id, .. }
            | Self::StepSkipped { plan_id, .. }
            | Self::CheckpointCreated { plan_id, .. }
            | Self::ExecutionPaused { plan_id, .. }
            | Self::ExecutionResumed { plan_id }
            | Self::ExecutionCompleted { plan_id, .. }
            | Self::ExecutionFailed { plan_id, .. }
            | Self::ExecutionCancelled { plan_id }
            | Self::RollbackStarted { plan_id, .. }
            | Self::RollbackCompleted { plan_id, .. } => Some(*plan_id),
            Self::Anomaly { anomaly } => anomaly.plan_id,
            _ => None,
        }
    }
}

/// Handle returned by [`EventBus::on_event`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Broadcast event bus with ordered callback dispatch.
///
/// `subscribe` hands out broadcast receivers. `on_event` registers a callback
/// that a single dispatcher invokes in emission order, off the publisher's
/// task, so slow handlers never stall metric sampling.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
    handlers: Arc<RwLock<Vec<(HandlerId, Handler)>>>,
    dispatcher: Arc<Mutex<Option<mpsc::UnboundedSender<Event>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
            handlers: Arc::new(RwLock::new(Vec::new())),
            dispatcher: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn publish(&self, event: Event) {
        if let Some(tx) = self.dispatcher.lock().as_ref() {
            let _ = tx.send(event.clone());
        }
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Register a callback for every subsequent event.
    pub fn on_event<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        self.ensure_dispatcher();
        id
    }

    /// Unregister a callback. Returns false if it was not registered.
    pub fn off_event(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    fn ensure_dispatcher(&self) {
        let mut slot = self.dispatcher.lock();
        if slot.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let handlers = self.handlers.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    while let Some(event) = rx.recv().await {
                        dispatch(&handlers, &event);
                    }
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    while let Some(event) = rx.blocking_recv() {
                        dispatch(&handlers, &event);
                    }
                });
            }
        }
        *slot = Some(tx);
    }
}

fn dispatch(handlers: &RwLock<Vec<(HandlerId, Handler)>>, event: &Event) {
    let snapshot: Vec<Handler> = handlers.read().iter().map(|(_, h)| h.clone()).collect();
    for handler in snapshot {
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            tracing::warn!(event = event.name(), "event handler panicked");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
