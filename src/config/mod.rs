use garde::Validate;
use serde::Deserialize;
use std::time::Duration;

use crate::models::generation::GenerationRequest;
use crate::services::polling::PollPolicy;

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    /// FusionBrain API key (sent as `X-Key`). Only the worker and the
    /// generate tool need it; the client rejects a blank key.
    #[serde(default)]
    #[garde(skip)]
    pub fusion_brain_api_key: String,

    /// FusionBrain secret key (sent as `X-Secret`)
    #[serde(default)]
    #[garde(skip)]
    pub fusion_brain_secret_key: String,

    #[serde(default = "default_base_url")]
    #[garde(length(min = 1))]
    pub fusion_brain_base_url: String,

    #[serde(default = "default_dimension")]
    #[garde(range(min = 64, max = 4096))]
    pub default_image_width: u32,

    #[serde(default = "default_dimension")]
    #[garde(range(min = 64, max = 4096))]
    pub default_image_height: u32,

    #[serde(default = "default_num_images")]
    #[garde(range(min = 1))]
    pub default_num_images: u32,

    #[garde(skip)]
    pub default_style: Option<String>,

    #[garde(skip)]
    pub default_negative_prompt: Option<String>,

    /// HTTP timeout for generation API calls, in seconds
    #[serde(default = "default_generation_timeout")]
    #[garde(range(min = 1))]
    pub default_generation_timeout: u64,

    /// Interval between ad-hoc status checks, in seconds
    #[serde(default = "default_check_interval")]
    #[garde(range(min = 1))]
    pub default_check_interval: u64,

    /// Status checks before an ad-hoc wait gives up
    #[serde(default = "default_max_attempts")]
    #[garde(range(min = 1))]
    pub default_max_attempts: u32,

    #[serde(default = "default_db_max_connections")]
    #[garde(range(min = 1))]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    #[garde(skip)]
    pub db_min_connections: u32,

    /// Maximum lifetime of a pooled connection, in seconds
    #[serde(default = "default_db_conn_max_lifetime")]
    #[garde(range(min = 1))]
    pub db_conn_max_lifetime: u64,

    /// How long a claimed job stays invisible to other workers, in seconds
    #[serde(default = "default_claim_lease_secs")]
    #[garde(range(min = 1))]
    pub claim_lease_secs: u64,

    /// Upper bound on jobs claimed by one batch pass
    #[serde(default = "default_claim_batch_size")]
    #[garde(range(min = 1))]
    pub claim_batch_size: i64,

    /// Cron expression (with seconds) for the submission stage in cron mode
    #[serde(default = "default_generator_schedule")]
    #[garde(length(min = 1))]
    pub generator_schedule: String,

    /// Cron expression (with seconds) for the polling stage in cron mode
    #[serde(default = "default_processor_schedule")]
    #[garde(length(min = 1))]
    pub processor_schedule: String,

    /// Prevent the two stages from running at the same time in cron mode
    #[serde(default = "default_serialize_stages")]
    #[garde(skip)]
    pub serialize_stages: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(garde::Report),

    #[error("CLAIM_LEASE_SECS ({lease}) must be at least {required}: twice DEFAULT_GENERATION_TIMEOUT plus the poll delay")]
    LeaseTooShort { lease: u64, required: u64 },
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_base_url() -> String {
    "https://api-key.fusionbrain.ai".to_string()
}

fn default_dimension() -> u32 {
    1024
}

fn default_num_images() -> u32 {
    1
}

fn default_generation_timeout() -> u64 {
    300
}

fn default_check_interval() -> u64 {
    2
}

fn default_max_attempts() -> u32 {
    30
}

fn default_db_max_connections() -> u32 {
    25
}

fn default_db_min_connections() -> u32 {
    1
}

fn default_db_conn_max_lifetime() -> u64 {
    300
}

fn default_claim_lease_secs() -> u64 {
    900
}

fn default_claim_batch_size() -> i64 {
    100
}

fn default_generator_schedule() -> String {
    "0 */3 * * * *".to_string()
}

fn default_processor_schedule() -> String {
    "0 */7 * * * *".to_string()
}

fn default_serialize_stages() -> bool {
    true
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Build from explicit key/value pairs (upper-case keys, as in the environment).
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: AppConfig = envy::from_iter(vars)?;
        config.validate().map_err(ConfigError::Invalid)?;

        let required = config.min_claim_lease_secs();
        if config.claim_lease_secs < required {
            return Err(ConfigError::LeaseTooShort {
                lease: config.claim_lease_secs,
                required,
            });
        }
        Ok(config)
    }

    /// Shortest lease that outlives the work done between two renewals.
    ///
    /// A submission may fetch the pipeline list and then run, each bounded
    /// by the HTTP timeout; a polling attempt is one status call plus the
    /// inter-attempt delay.
    pub fn min_claim_lease_secs(&self) -> u64 {
        let poll_delay = PollPolicy::default().delay.as_secs();
        2 * self.default_generation_timeout + poll_delay
    }

    /// Generation request defaults applied to every submitted prompt.
    pub fn generation_defaults(&self) -> GenerationDefaults {
        GenerationDefaults {
            width: self.default_image_width,
            height: self.default_image_height,
            num_images: self.default_num_images,
            style: non_empty(&self.default_style),
            negative_prompt: non_empty(&self.default_negative_prompt),
        }
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.default_generation_timeout)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.default_check_interval)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

/// Per-request parameters that do not come from the job row.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationDefaults {
    pub width: u32,
    pub height: u32,
    pub num_images: u32,
    pub style: Option<String>,
    pub negative_prompt: Option<String>,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            width: default_dimension(),
            height: default_dimension(),
            num_images: default_num_images(),
            style: None,
            negative_prompt: None,
        }
    }
}

impl GenerationDefaults {
    pub fn request_for(&self, prompt: impl Into<String>) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.into(),
            width: self.width,
            height: self.height,
            num_images: self.num_images,
            style: self.style.clone(),
            negative_prompt: self.negative_prompt.clone(),
        }
    }
}
