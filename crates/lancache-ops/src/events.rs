//! Outbound event bus.
//!
//! An in-process publisher with a fixed topic set. The API layer holds
//! a subscription and fans events out to its own clients; publishing
//! never blocks, and a subscriber that falls behind loses the oldest
//! events (broadcast lag) instead of stalling the pipeline.

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Progress payload for the bulk log processor.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingProgress {
    pub datasource: String,
    pub bytes_processed: u64,
    pub bytes_total: u64,
    pub percent_complete: f64,
    pub lines_processed: u64,
    pub unparsed_lines: u64,
    pub timestamp: String,
}

/// Completion payload for a catch-up pass over a datasource.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FastProcessingComplete {
    pub datasource: String,
    pub lines_processed: u64,
    pub downloads_touched: u64,
    pub success: bool,
}

/// Generic start payload for a named operation.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationStarted {
    pub operation_id: String,
    pub name: String,
    pub timestamp: String,
}

/// Generic progress payload for a named operation.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationProgress {
    pub operation_id: String,
    pub percent_complete: f64,
    pub message: String,
    pub timestamp: String,
}

/// Terminal payload for a named operation. `success` is authoritative;
/// exactly one of these is published per operation.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationComplete {
    pub operation_id: String,
    pub success: bool,
    pub cancelled: bool,
    pub message: String,
    pub error: Option<String>,
    pub timestamp: String,
}

/// Live speed snapshot, carried as pre-serialized JSON.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeedUpdate {
    pub snapshot: serde_json::Value,
}

/// Steam session failure surfaced to the UI.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SteamSessionError {
    pub message: String,
}

/// Everything the core publishes, one variant per wire topic.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "payload")]
pub enum Event {
    DownloadsRefresh,
    ProcessingProgress(ProcessingProgress),
    FastProcessingComplete(FastProcessingComplete),
    DepotMappingStarted(OperationStarted),
    DepotMappingProgress(OperationProgress),
    DepotMappingComplete(OperationComplete),
    DatabaseResetProgress(OperationProgress),
    LogRemovalProgress(OperationProgress),
    LogRemovalComplete(OperationComplete),
    GameRemovalProgress(OperationProgress),
    GameRemovalComplete(OperationComplete),
    ServiceRemovalProgress(OperationProgress),
    ServiceRemovalComplete(OperationComplete),
    CacheClearProgress(OperationProgress),
    CacheClearComplete(OperationComplete),
    CorruptionRemovalStarted(OperationStarted),
    CorruptionRemovalComplete(OperationComplete),
    GameDetectionStarted(OperationStarted),
    GameDetectionComplete(OperationComplete),
    DownloadSpeedUpdate(SpeedUpdate),
    SteamSessionError(SteamSessionError),
    SteamAutoLogout,
}

impl Event {
    /// Wire topic name, verbatim what the API layer subscribes to.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::DownloadsRefresh => "DownloadsRefresh",
            Self::ProcessingProgress(_) => "ProcessingProgress",
            Self::FastProcessingComplete(_) => "FastProcessingComplete",
            Self::DepotMappingStarted(_) => "DepotMappingStarted",
            Self::DepotMappingProgress(_) => "DepotMappingProgress",
            Self::DepotMappingComplete(_) => "DepotMappingComplete",
            Self::DatabaseResetProgress(_) => "DatabaseResetProgress",
            Self::LogRemovalProgress(_) => "LogRemovalProgress",
            Self::LogRemovalComplete(_) => "LogRemovalComplete",
            Self::GameRemovalProgress(_) => "GameRemovalProgress",
            Self::GameRemovalComplete(_) => "GameRemovalComplete",
            Self::ServiceRemovalProgress(_) => "ServiceRemovalProgress",
            Self::ServiceRemovalComplete(_) => "ServiceRemovalComplete",
            Self::CacheClearProgress(_) => "CacheClearProgress",
            Self::CacheClearComplete(_) => "CacheClearComplete",
            Self::CorruptionRemovalStarted(_) => "CorruptionRemovalStarted",
            Self::CorruptionRemovalComplete(_) => "CorruptionRemovalComplete",
            Self::GameDetectionStarted(_) => "GameDetectionStarted",
            Self::GameDetectionComplete(_) => "GameDetectionComplete",
            Self::DownloadSpeedUpdate(_) => "DownloadSpeedUpdate",
            Self::SteamSessionError(_) => "SteamSessionError",
            Self::SteamAutoLogout => "SteamAutoLogout",
        }
    }
}

/// Current UTC time in the wire timestamp format.
pub fn wire_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Non-blocking broadcast publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` bounds how far a slow subscriber may lag before it
    /// starts losing events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns the number of live subscribers; zero
    /// subscribers is not an error.
    pub fn publish(&self, event: Event) -> usize {
        trace!(topic = event.topic(), "publish");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
