//! Contribution tasks and permission decisions.

use crate::identity::{TaskId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// TASK CATEGORIES
// ============================================================================

/// Closed set of background work the device may be asked to donate
/// capacity for. The user allow-lists categories explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    EmbeddingGeneration,
    Transcription,
    DocumentOcr,
    ModelEvaluation,
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskCategory::EmbeddingGeneration => "embedding_generation",
            TaskCategory::Transcription => "transcription",
            TaskCategory::DocumentOcr => "document_ocr",
            TaskCategory::ModelEvaluation => "model_evaluation",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedding_generation" => Ok(TaskCategory::EmbeddingGeneration),
            "transcription" => Ok(TaskCategory::Transcription),
            "document_ocr" => Ok(TaskCategory::DocumentOcr),
            "model_evaluation" => Ok(TaskCategory::ModelEvaluation),
            other => Err(format!("unknown task category: {other}")),
        }
    }
}

// ============================================================================
// PERMISSION DECISIONS
// ============================================================================

/// Why an admission request was denied. Every variant renders a
/// human-readable reason so the user always understands why no background
/// work is occurring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    ContributionDisabled,
    TermsNotAccepted,
    UserActivity,
    InsufficientIdleTime {
        current_seconds: u64,
        required_seconds: u64,
    },
    OnBatteryPower,
    BatteryBelowMinimum {
        current_percent: f32,
        required_percent: f32,
    },
    OutsideAllowedWindow,
    NoResourceHeadroom,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::ContributionDisabled => write!(f, "contribution is disabled"),
            DenialReason::TermsNotAccepted => {
                write!(f, "contribution terms have not been accepted")
            }
            DenialReason::UserActivity => write!(f, "device active"),
            DenialReason::InsufficientIdleTime {
                current_seconds,
                required_seconds,
            } => write!(
                f,
                "device idle for {current_seconds}s of the required {required_seconds}s"
            ),
            DenialReason::OnBatteryPower => {
                write!(f, "on battery while external power is required")
            }
            DenialReason::BatteryBelowMinimum {
                current_percent,
                required_percent,
            } => write!(
                f,
                "battery below threshold ({current_percent:.0}% < {required_percent:.0}%)"
            ),
            DenialReason::OutsideAllowedWindow => {
                write!(f, "outside the allowed contribution window")
            }
            DenialReason::NoResourceHeadroom => write!(f, "no resource headroom available"),
        }
    }
}

/// Outcome of one admission check. Evaluated fresh on every request; a grant
/// is never cached across checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PermissionDecision {
    Granted {
        max_cpu_percent: f32,
        max_ram_mb: u64,
        max_duration_seconds: u64,
        allowed_categories: Vec<TaskCategory>,
    },
    Denied {
        reason: DenialReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_seconds: Option<u64>,
    },
}

impl PermissionDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionDecision::Granted { .. })
    }

    pub fn denied(reason: DenialReason) -> Self {
        PermissionDecision::Denied {
            reason,
            retry_after_seconds: None,
        }
    }

    pub fn denied_retry_after(reason: DenialReason, retry_after_seconds: u64) -> Self {
        PermissionDecision::Denied {
            reason,
            retry_after_seconds: Some(retry_after_seconds),
        }
    }
}

// ============================================================================
// CONTRIBUTION TASKS
// ============================================================================

/// An admitted unit of background work. Created only after a `Granted`
/// decision; destroyed on completion, abort, or denial re-evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionTask {
    pub task_id: TaskId,
    pub category: TaskCategory,
    /// Ceilings inherited from the grant that admitted this task.
    pub max_cpu_percent: f32,
    pub max_ram_mb: u64,
    pub started_at: Timestamp,
    /// Completion fraction in `[0.0, 1.0]`.
    pub progress: f32,
    /// Accumulated CPU time donated so far.
    pub cpu_seconds: f64,
    pub peak_ram_mb: u64,
}

impl ContributionTask {
    pub fn new(
        task_id: TaskId,
        category: TaskCategory,
        max_cpu_percent: f32,
        max_ram_mb: u64,
        started_at: Timestamp,
    ) -> Self {
        Self {
            task_id,
            category,
            max_cpu_percent,
            max_ram_mb,
            started_at,
            progress: 0.0,
            cpu_seconds: 0.0,
            peak_ram_mb: 0,
        }
    }
}

/// How a contribution task ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    /// Aborted immediately on a denial re-evaluation.
    Aborted { reason: String },
    Failed { reason: String },
}

/// Report sent upstream when a task finishes, with accumulated resource
/// usage for transparency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: ContributionTask,
    pub outcome: TaskOutcome,
    pub finished_at: Timestamp,
}

// ============================================================================
// TESTS
// ============================================================================
