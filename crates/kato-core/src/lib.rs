//! kato-core: deterministic memory-and-prediction engine.
//!
//! Observation -> short-term memory -> learned patterns -> ranked temporal
//! predictions, with per-kb_id hermetic isolation and full determinism
//! given a fixed initial state and operation sequence.

pub mod bloom;
pub mod emotive;
pub mod error;
pub mod filter;
pub mod kb_id;
pub mod matcher;
pub mod metrics;
pub mod minhash;
pub mod pattern;
pub mod prediction;
pub mod processor;
pub mod session;
pub mod settings;
pub mod stm;
pub mod store;
pub mod symbol;
pub mod symbol_cache;

pub use bloom::{Bloom, BloomCache};
pub use emotive::{EmotiveWindow, PatternEmotives};
pub use error::KatoError;
pub use kb_id::derive_kb_id;
pub use matcher::{match_pattern, MatchOutcome, Matched};
pub use metrics::Metrics;
pub use prediction::{Prediction, PredictionError};
pub use processor::{LearnOutcome, ObserveOutcome, Processor};
pub use session::{SessionManager, SessionStore, SessionView};
pub use settings::{Settings, SessionConfig, SessionConfigPatch};
pub use stm::Stm;
pub use store::{PatternStore, SledPatternStore};
pub use symbol::{Event, vector_symbol};
pub use symbol_cache::SymbolProbabilityCache;
