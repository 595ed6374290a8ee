use serde::{Deserialize, Serialize};

/// Parameters sent to the generation service for one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub num_images: u32,
    pub style: Option<String>,
    pub negative_prompt: Option<String>,
}

/// Remote-side generation state as reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationStatus {
    Initial,
    Processing,
    Done,
    Failed,
    Other(String),
}

impl GenerationStatus {
    /// The status endpoint has been seen to report failure as both
    /// `FAIL` and `FAILED`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "INITIAL" => GenerationStatus::Initial,
            "PROCESSING" => GenerationStatus::Processing,
            "DONE" => GenerationStatus::Done,
            "FAIL" | "FAILED" => GenerationStatus::Failed,
            other => GenerationStatus::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationStatus::Initial => f.write_str("INITIAL"),
            GenerationStatus::Processing => f.write_str("PROCESSING"),
            GenerationStatus::Done => f.write_str("DONE"),
            GenerationStatus::Failed => f.write_str("FAILED"),
            GenerationStatus::Other(s) => f.write_str(s),
        }
    }
}

/// Result of one status poll.
#[derive(Debug, Clone)]
pub struct PollResponse {
    pub correlation_id: String,
    pub status: GenerationStatus,
    pub files: Vec<String>,
    pub censored: bool,
    pub error_description: Option<String>,
}

impl PollResponse {
    /// First generated image, if the service returned any.
    pub fn first_file(&self) -> Option<&str> {
        self.files.first().map(String::as_str)
    }
}
