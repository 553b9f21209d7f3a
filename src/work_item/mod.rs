pub mod fragments;
pub mod trace;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use fragments::{Fragment, ResultFragments};
pub use trace::{NewStepTraceEntry, StepOutcome, StepTraceEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Draft,
    Queued,
    Running,
    Completed,
    Failed,
}

impl WorkItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use WorkItemStatus::{Completed, Draft, Failed, Queued, Running};

        matches!(
            (self, next),
            (Draft, Queued)
                | (Draft, Running)
                | (Queued, Running)
                | (Failed, Running)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    /// Input may only be edited while no run owns the item.
    pub fn accepts_input_edits(self) -> bool {
        matches!(self, Self::Draft | Self::Queued | Self::Failed)
    }
}

/// Which pipeline a work item runs: a product "test" or an ads "flow".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    Test,
    Flow,
}

impl WorkItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Flow => "flow",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "test" => Some(Self::Test),
            "flow" => Some(Self::Flow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angles: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landing_copy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headlines: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copies: Option<String>,
}

/// Reference to media uploaded with the submission. Blob storage lives
/// outside this crate; only the locator is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSnapshot {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub benefits: Vec<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub landing_url: Option<String>,
    #[serde(default)]
    pub uploads: Vec<MediaRef>,
    #[serde(default)]
    pub prompt_overrides: PromptOverrides,
    #[serde(default)]
    pub angle_count: Option<u8>,
    #[serde(default)]
    pub images_per_angle: Option<u8>,
}

impl InputSnapshot {
    pub const DEFAULT_ANGLE_COUNT: u8 = 3;
    pub const DEFAULT_IMAGES_PER_ANGLE: u8 = 1;

    pub fn from_json(value: Value) -> Result<Self, String> {
        let snapshot: Self = serde_json::from_value(value)
            .map_err(|error| format!("input snapshot is not valid: {error}"))?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err(String::from("Field 'title' is required"));
        }
        if let Some(count) = self.angle_count {
            if count == 0 || count > 10 {
                return Err(String::from("Field 'angle_count' must be between 1 and 10"));
            }
        }
        if let Some(count) = self.images_per_angle {
            if count == 0 || count > 4 {
                return Err(String::from(
                    "Field 'images_per_angle' must be between 1 and 4",
                ));
            }
        }
        Ok(())
    }

    pub fn angle_count(&self) -> u8 {
        self.angle_count.unwrap_or(Self::DEFAULT_ANGLE_COUNT)
    }

    pub fn images_per_angle(&self) -> u8 {
        self.images_per_angle
            .unwrap_or(Self::DEFAULT_IMAGES_PER_ANGLE)
    }

    pub fn landing_url(&self) -> Option<&str> {
        self.landing_url
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkItem {
    pub id: String,
    pub kind: WorkItemKind,
    pub status: WorkItemStatus,
    pub input_snapshot: InputSnapshot,
    pub result_fragments: ResultFragments,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}
