use serde::{Deserialize, Serialize};

/// Lifecycle of the shared transcript record for an episode.
///
/// `NotReady` is the wire-level value for "no record exists yet" — it is
/// never written to the database. Records are created directly in
/// `Transcribing` (there is no intermediate `Queued` write; the variant
/// exists for wire compatibility and transient reads).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptStatus {
    NotReady,
    Queued,
    Transcribing,
    Ready,
    Failed,
}

impl TranscriptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Transcribing)
    }
}

impl std::fmt::Display for TranscriptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotReady => write!(f, "not_ready"),
            Self::Queued => write!(f, "queued"),
            Self::Transcribing => write!(f, "transcribing"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl From<String> for TranscriptStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => Self::Queued,
            "transcribing" => Self::Transcribing,
            "ready" => Self::Ready,
            "failed" => Self::Failed,
            _ => Self::NotReady,
        }
    }
}

/// Lifecycle of a per-level summary record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    Queued,
    Summarizing,
    Ready,
    Failed,
}

impl SummaryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Summarizing)
    }
}

impl std::fmt::Display for SummaryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Summarizing => write!(f, "summarizing"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl From<String> for SummaryStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "summarizing" => Self::Summarizing,
            "ready" => Self::Ready,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }
}

/// Requested summary granularity. Each level is tracked as its own job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryLevel {
    Quick,
    Deep,
}

impl SummaryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Deep => "deep",
        }
    }
}

impl std::fmt::Display for SummaryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SummaryLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Self::Quick),
            "deep" => Ok(Self::Deep),
            other => Err(format!("unknown summary level: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub audio_url: String,
    pub language: String,
    pub feed_source: String,
    pub published_date: Option<String>,
    pub added_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub id: i64,
    pub episode_id: i64,
    pub status: TranscriptStatus,
    pub full_text: Option<String>,
    pub segments_json: Option<String>,
    pub language: Option<String>,
    pub provider: Option<String>,
    pub duration_secs: Option<f64>,
    pub speaker_count: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub id: i64,
    pub episode_id: i64,
    pub level: SummaryLevel,
    pub status: SummaryStatus,
    pub content: Option<String>,
    pub language: Option<String>,
    pub model: Option<String>,
    pub language_corrected: bool,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}
