//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};

/// Default completions path appended to generic provider base URLs.
pub const COMPLETIONS_PATH: &str = "/chat/completions";

/// Lifecycle status of a chat task.
///
/// Statuses are totally ordered `Pending < Running < {Completed, Failed}`.
/// A task only ever moves forward along that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Admitted and persisted, waiting in the queue
    Pending,
    /// Claimed by a dispatcher worker
    Running,
    /// Backend stream finished cleanly
    Completed,
    /// Terminated by an error, overload or client cancellation
    Failed,
}

impl TaskStatus {
    /// Parse a status from its stored representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Position in the lifecycle order. Terminal states share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Pending -> Failed` is allowed so an admitted task that could not be
    /// queued is never re-admitted by recovery.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provider family of a backend instance.
///
/// Each variant owns its credential header and endpoint shaping rule, so
/// callers never compare provider names directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-style API: bearer token, base URL + `/chat/completions`
    OpenAiCompatible,
    /// Azure OpenAI: `api-key` header, URL is already the full deployment endpoint
    Azure,
}

impl ProviderKind {
    /// Classify a provider by its configured name.
    ///
    /// # Examples
    /// ```
    /// use llm_gateway::domain::value_objects::ProviderKind;
    ///
    /// assert_eq!(ProviderKind::from_name("Azure"), ProviderKind::Azure);
    /// assert_eq!(ProviderKind::from_name("deepseek"), ProviderKind::OpenAiCompatible);
    /// ```
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "azure" | "azure-openai" | "azure_openai" => Self::Azure,
            _ => Self::OpenAiCompatible,
        }
    }

    /// Resolve the chat endpoint for a configured base URL.
    pub fn endpoint(&self, base_url: &str) -> String {
        match self {
            Self::Azure => base_url.to_string(),
            Self::OpenAiCompatible => {
                if base_url.ends_with(COMPLETIONS_PATH) {
                    base_url.to_string()
                } else {
                    format!("{}{}", base_url.trim_end_matches('/'), COMPLETIONS_PATH)
                }
            }
        }
    }

    /// Credential header (name, value) for an API key.
    pub fn auth_header(&self, api_key: &str) -> (&'static str, String) {
        match self {
            Self::Azure => ("api-key", api_key.to_string()),
            Self::OpenAiCompatible => ("authorization", format!("Bearer {}", api_key)),
        }
    }
}

impl Default for ProviderKind {
    fn default() -> Self {
        Self::OpenAiCompatible
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAiCompatible => write!(f, "openai-compatible"),
            Self::Azure => write!(f, "azure"),
        }
    }
}
