//! Error kinds for the pattern lifecycle and prediction engine.
//!
//! Small `Display + std::error::Error` enums at each component boundary,
//! composed upward into `KatoError` at the orchestrator, instead of
//! `anyhow`/`thiserror`.

use std::fmt;

/// Malformed observation input (§7 `InvalidInput`).
#[derive(Debug, Clone, PartialEq)]
pub enum InputError {
    NonFiniteEmotive { key: String, value: f64 },
    NonFiniteVectorComponent { index: usize },
    EmptyVector,
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::NonFiniteEmotive { key, value } => {
                write!(f, "emotive '{key}' has non-finite value {value}")
            }
            InputError::NonFiniteVectorComponent { index } => {
                write!(f, "vector component at index {index} is not finite")
            }
            InputError::EmptyVector => write!(f, "vector observation is empty"),
        }
    }
}
impl std::error::Error for InputError {}

/// Session configuration rejected validation (§7 `InvalidConfig`).
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    OutOfRange { field: &'static str, value: f64 },
    BandsRowsMismatch { bands: u32, rows: u32, num_hashes: u32 },
    EmptyFilterPipelineUnderStrictMode,
    UnknownStage { stage: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::OutOfRange { field, value } => {
                write!(f, "config field '{field}' out of range: {value}")
            }
            ConfigError::BandsRowsMismatch { bands, rows, num_hashes } => write!(
                f,
                "minhash_bands ({bands}) * minhash_rows ({rows}) != minhash_num_hashes ({num_hashes})"
            ),
            ConfigError::EmptyFilterPipelineUnderStrictMode => {
                write!(f, "filter_pipeline is empty and STRICT_MODE is enabled")
            }
            ConfigError::UnknownStage { stage } => write!(f, "unknown filter stage '{stage}'"),
        }
    }
}
impl std::error::Error for ConfigError {}

/// Errors from the pattern store (C4) (§7 `StoreUnavailable`).
#[derive(Debug)]
pub enum StoreError {
    Sled(sled::Error),
    Serialization(serde_json::Error),
    PipelineOverflow { stage: String, size: usize },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sled(e) => write!(f, "store unavailable: {e}"),
            StoreError::Serialization(e) => write!(f, "store serialization failed: {e}"),
            StoreError::PipelineOverflow { stage, size } => {
                write!(f, "filter stage '{stage}' exceeded max_candidates_per_stage ({size} candidates)")
            }
        }
    }
}
impl std::error::Error for StoreError {}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Sled(e)
    }
}
impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e)
    }
}

/// Errors from the filter pipeline (C5).
#[derive(Debug)]
pub enum FilterError {
    Store(StoreError),
    Overflow { stage: String, size: usize, limit: usize },
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::Store(e) => write!(f, "{e}"),
            FilterError::Overflow { stage, size, limit } => write!(
                f,
                "stage '{stage}' produced {size} candidates, exceeding max_candidates_per_stage ({limit})"
            ),
        }
    }
}
impl std::error::Error for FilterError {}

impl From<StoreError> for FilterError {
    fn from(e: StoreError) -> Self {
        FilterError::Store(e)
    }
}

/// Errors from metric computation (C7). Divide-by-zero is surfaced, never silently zeroed.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricError {
    DivideByZero { metric: &'static str },
}

impl fmt::Display for MetricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricError::DivideByZero { metric } => write!(f, "division by zero computing metric '{metric}'"),
        }
    }
}
impl std::error::Error for MetricError {}

/// Errors from the session manager (C9).
#[derive(Debug)]
pub enum SessionError {
    NotFound { session_id: String },
    Busy { session_id: String },
    ConfigInvalid(ConfigError),
    Store(StoreError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotFound { session_id } => write!(f, "session '{session_id}' not found"),
            SessionError::Busy { session_id } => write!(f, "session '{session_id}' is busy (lock timeout)"),
            SessionError::ConfigInvalid(e) => write!(f, "invalid session config: {e}"),
            SessionError::Store(e) => write!(f, "session store error: {e}"),
        }
    }
}
impl std::error::Error for SessionError {}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Store(e)
    }
}
impl From<ConfigError> for SessionError {
    fn from(e: ConfigError) -> Self {
        SessionError::ConfigInvalid(e)
    }
}

/// `2StringRuleViolated`: learn/predict attempted with insufficient STM. Caller-visible, non-fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwoStringRuleViolated {
    pub total_tokens: usize,
}

impl fmt::Display for TwoStringRuleViolated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "2-string rule violated: STM has {} total tokens, need >= 2", self.total_tokens)
    }
}
impl std::error::Error for TwoStringRuleViolated {}

/// Top-level error the processor orchestrator (C10) surfaces to callers.
#[derive(Debug)]
pub enum KatoError {
    Input(InputError),
    Config(ConfigError),
    Session(SessionError),
    Filter(FilterError),
    Metric(MetricError),
    TwoStringRule(TwoStringRuleViolated),
    Store(StoreError),
}

impl fmt::Display for KatoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KatoError::Input(e) => write!(f, "{e}"),
            KatoError::Config(e) => write!(f, "{e}"),
            KatoError::Session(e) => write!(f, "{e}"),
            KatoError::Filter(e) => write!(f, "{e}"),
            KatoError::Metric(e) => write!(f, "{e}"),
            KatoError::TwoStringRule(e) => write!(f, "{e}"),
            KatoError::Store(e) => write!(f, "{e}"),
        }
    }
}
impl std::error::Error for KatoError {}

impl From<InputError> for KatoError {
    fn from(e: InputError) -> Self {
        KatoError::Input(e)
    }
}
impl From<ConfigError> for KatoError {
    fn from(e: ConfigError) -> Self {
        KatoError::Config(e)
    }
}
impl From<SessionError> for KatoError {
    fn from(e: SessionError) -> Self {
        KatoError::Session(e)
    }
}
impl From<FilterError> for KatoError {
    fn from(e: FilterError) -> Self {
        KatoError::Filter(e)
    }
}
impl From<MetricError> for KatoError {
    fn from(e: MetricError) -> Self {
        KatoError::Metric(e)
    }
}
impl From<TwoStringRuleViolated> for KatoError {
    fn from(e: TwoStringRuleViolated) -> Self {
        KatoError::TwoStringRule(e)
    }
}
impl From<StoreError> for KatoError {
    fn from(e: StoreError) -> Self {
        KatoError::Store(e)
    }
}
