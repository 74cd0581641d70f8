//! Process-wide catalogue of in-flight operations.
//!
//! Every long-running job registers here before doing work. The
//! registry owns the cancellation token, throttles progress emission
//! to one event per second per operation, keeps percent monotonic, and
//! guarantees exactly one completion event per operation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, Utc};
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{
    wire_timestamp, Event, EventBus, OperationComplete, OperationProgress, OperationStarted,
};

/// Minimum spacing between progress events for one operation.
const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_secs(1);

const ID_LENGTH: usize = 16;

/// Kinds of long-running operations the core runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    CacheClear,
    ServiceRemove,
    GameRemove,
    CorruptionRemove,
    LogServiceRemove,
    DatabaseReset,
    DepotMapping,
    GameDetection,
}

impl OperationType {
    /// Inverse of [`OperationType::as_str`], used when replaying
    /// persisted operation state.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cache_clear" => Some(Self::CacheClear),
            "service_remove" => Some(Self::ServiceRemove),
            "game_remove" => Some(Self::GameRemove),
            "corruption_remove" => Some(Self::CorruptionRemove),
            "log_service_remove" => Some(Self::LogServiceRemove),
            "database_reset" => Some(Self::DatabaseReset),
            "depot_mapping" => Some(Self::DepotMapping),
            "game_detection" => Some(Self::GameDetection),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheClear => "cache_clear",
            Self::ServiceRemove => "service_remove",
            Self::GameRemove => "game_remove",
            Self::CorruptionRemove => "corruption_remove",
            Self::LogServiceRemove => "log_service_remove",
            Self::DatabaseReset => "database_reset",
            Self::DepotMapping => "depot_mapping",
            Self::GameDetection => "game_detection",
        }
    }
}

type SharedChild = Arc<Mutex<Child>>;

struct OperationInfo {
    op_type: OperationType,
    name: String,
    token: CancellationToken,
    child: Option<SharedChild>,
    started_at: NaiveDateTime,
    percent: f64,
    message: String,
    cancelled: bool,
    completed: bool,
    succeeded: Option<bool>,
    last_emit: Option<Instant>,
}

/// Read-only view of a registered operation.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationSnapshot {
    pub id: String,
    pub op_type: OperationType,
    pub name: String,
    pub started_at: NaiveDateTime,
    pub percent: f64,
    pub message: String,
    pub cancelled: bool,
    pub completed: bool,
    pub succeeded: Option<bool>,
}

/// The registry itself. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct OperationRegistry {
    bus: EventBus,
    operations: Arc<DashMap<String, OperationInfo>>,
}

impl OperationRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            operations: Arc::new(DashMap::new()),
        }
    }

    /// Register a new operation and return its id. The `Started` event
    /// for types that have one is published here.
    pub fn register(
        &self,
        op_type: OperationType,
        name: impl Into<String>,
        token: CancellationToken,
    ) -> String {
        let id = generate_id();
        let name = name.into();
        debug!(id = %id, op_type = op_type.as_str(), name = %name, "operation registered");

        self.operations.insert(
            id.clone(),
            OperationInfo {
                op_type,
                name: name.clone(),
                token,
                child: None,
                started_at: Utc::now().naive_utc(),
                percent: 0.0,
                message: String::new(),
                cancelled: false,
                completed: false,
                succeeded: None,
                last_emit: None,
            },
        );

        let started = OperationStarted {
            operation_id: id.clone(),
            name,
            timestamp: wire_timestamp(),
        };
        match op_type {
            OperationType::CorruptionRemove => {
                self.bus.publish(Event::CorruptionRemovalStarted(started));
            }
            OperationType::GameDetection => {
                self.bus.publish(Event::GameDetectionStarted(started));
            }
            OperationType::DepotMapping => {
                self.bus.publish(Event::DepotMappingStarted(started));
            }
            _ => {}
        }

        id
    }

    /// Request cancellation. Idempotent: repeated calls and calls on an
    /// already-completed operation return `true`; an unknown id returns
    /// `false`.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(mut info) = self.operations.get_mut(id) else {
            return false;
        };
        if info.completed {
            return true;
        }
        if !info.cancelled {
            debug!(id = %id, "operation cancellation requested");
            info.cancelled = true;
            info.token.cancel();
        }
        true
    }

    /// Attach a child process handle so `force_kill` can reach it.
    pub fn attach_child(&self, id: &str, child: Child) {
        if let Some(mut info) = self.operations.get_mut(id) {
            info.child = Some(Arc::new(Mutex::new(child)));
        }
    }

    /// Kill the operation's child process, if any. Also requests
    /// cooperative cancellation.
    pub fn force_kill(&self, id: &str) -> bool {
        let child = {
            let Some(info) = self.operations.get(id) else {
                return false;
            };
            info.child.clone()
        };
        self.cancel(id);
        if let Some(child) = child {
            if let Ok(mut guard) = child.try_lock() {
                if let Err(e) = guard.start_kill() {
                    warn!(id = %id, "failed to kill child process: {e}");
                    return false;
                }
                return true;
            }
        }
        false
    }

    pub fn get(&self, id: &str) -> Option<OperationSnapshot> {
        self.operations.get(id).map(|info| snapshot(id, &info))
    }

    /// List operations, optionally filtered by type. Completed entries
    /// are retained until pruned so late `cancel` calls still resolve.
    pub fn list(&self, filter: Option<OperationType>) -> Vec<OperationSnapshot> {
        let mut out: Vec<OperationSnapshot> = self
            .operations
            .iter()
            .filter(|entry| filter.is_none_or(|t| entry.op_type == t))
            .map(|entry| snapshot(entry.key(), &entry))
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    /// Record progress and, when a progress topic exists for the type
    /// and the 1/s token bucket permits, publish it. Percent never
    /// decreases; progress after completion is ignored.
    pub fn update_progress(&self, id: &str, percent: f64, message: impl Into<String>) {
        let message = message.into();
        let mut publish: Option<(OperationType, OperationProgress)> = None;

        if let Some(mut info) = self.operations.get_mut(id) {
            if info.completed {
                return;
            }
            let clamped = percent.clamp(0.0, 100.0).max(info.percent);
            info.percent = clamped;
            info.message.clone_from(&message);

            let due = info
                .last_emit
                .is_none_or(|t| t.elapsed() >= PROGRESS_EMIT_INTERVAL);
            if due {
                info.last_emit = Some(Instant::now());
                publish = Some((
                    info.op_type,
                    OperationProgress {
                        operation_id: id.to_string(),
                        percent_complete: clamped,
                        message,
                        timestamp: wire_timestamp(),
                    },
                ));
            }
        }

        if let Some((op_type, progress)) = publish {
            if let Some(event) = progress_event(op_type, progress) {
                self.bus.publish(event);
            }
        }
    }

    /// Mark the operation finished and publish its completion event.
    ///
    /// Returns `true` only for the first call; later calls are no-ops,
    /// which is what suppresses duplicate completion events.
    pub fn complete(&self, id: &str, success: bool, error: Option<String>) -> bool {
        let mut publish: Option<(OperationType, OperationComplete)> = None;

        if let Some(mut info) = self.operations.get_mut(id) {
            if info.completed {
                return false;
            }
            info.completed = true;
            info.succeeded = Some(success);
            info.child = None;
            if success {
                info.percent = 100.0;
            }
            publish = Some((
                info.op_type,
                OperationComplete {
                    operation_id: id.to_string(),
                    success,
                    cancelled: info.cancelled,
                    message: info.message.clone(),
                    error,
                    timestamp: wire_timestamp(),
                },
            ));
        } else {
            return false;
        }

        if let Some((op_type, complete)) = publish {
            if let Some(event) = complete_event(op_type, complete) {
                self.bus.publish(event);
            }
        }
        true
    }

    /// Drop completed entries. Callers decide the cadence.
    pub fn prune_completed(&self) {
        self.operations.retain(|_, info| !info.completed);
    }

    /// The cancellation token for an operation, for handing to workers.
    pub fn token(&self, id: &str) -> Option<CancellationToken> {
        self.operations.get(id).map(|info| info.token.clone())
    }
}

fn snapshot(id: &str, info: &OperationInfo) -> OperationSnapshot {
    OperationSnapshot {
        id: id.to_string(),
        op_type: info.op_type,
        name: info.name.clone(),
        started_at: info.started_at,
        percent: info.percent,
        message: info.message.clone(),
        cancelled: info.cancelled,
        completed: info.completed,
        succeeded: info.succeeded,
    }
}

fn progress_event(op_type: OperationType, progress: OperationProgress) -> Option<Event> {
    match op_type {
        OperationType::CacheClear => Some(Event::CacheClearProgress(progress)),
        OperationType::ServiceRemove => Some(Event::ServiceRemovalProgress(progress)),
        OperationType::GameRemove => Some(Event::GameRemovalProgress(progress)),
        OperationType::LogServiceRemove => Some(Event::LogRemovalProgress(progress)),
        OperationType::DatabaseReset => Some(Event::DatabaseResetProgress(progress)),
        OperationType::DepotMapping => Some(Event::DepotMappingProgress(progress)),
        // Corruption removal and game detection only announce start and
        // completion.
        OperationType::CorruptionRemove | OperationType::GameDetection => None,
    }
}

/// The completion event topic for an operation type, if it has one.
pub fn complete_event(op_type: OperationType, complete: OperationComplete) -> Option<Event> {
    match op_type {
        OperationType::CacheClear => Some(Event::CacheClearComplete(complete)),
        OperationType::ServiceRemove => Some(Event::ServiceRemovalComplete(complete)),
        OperationType::GameRemove => Some(Event::GameRemovalComplete(complete)),
        OperationType::CorruptionRemove => Some(Event::CorruptionRemovalComplete(complete)),
        OperationType::LogServiceRemove => Some(Event::LogRemovalComplete(complete)),
        OperationType::DepotMapping => Some(Event::DepotMappingComplete(complete)),
        OperationType::GameDetection => Some(Event::GameDetectionComplete(complete)),
        // Database reset reports through its progress topic only.
        OperationType::DatabaseReset => None,
    }
}

fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect()
}
