//! # Mutalab Core
//!
//! Core library for Mutalab, a guided workflow for perturbation experiments:
//! upload an executable, pick a perturbation, test the variant in a sandbox, and
//! have the transformation service score the result.
//!
//! Provides the experiment stage machine, the orchestrator that drives it, the
//! transformation service client, auth token providers, and configuration.

pub mod config;
pub mod credentials;
pub mod error;
pub mod experiment;
pub mod orchestrator;
pub mod service;
pub mod types;

// Re-export commonly used types at the crate root.
pub use config::{MutalabConfig, RetryConfig, ServiceConfig, load_config};
pub use credentials::{
    EnvTokenProvider, FallbackTokenProvider, InMemoryTokenStore, KeyringTokenProvider,
    StaticToken, TokenProvider, TokenStore,
};
pub use error::{
    ConfigError, MutalabError, Result, ServiceError, TransitionError, ValidationError,
};
pub use experiment::{Experiment, ExperimentEvent, OriginalArtifact, VariantArtifact};
pub use orchestrator::{
    AnalysisInputs, ExperimentCallback, ExperimentOrchestrator, NoOpCallback, OrchestratorStatus,
    parse_rate,
};
pub use service::{HttpTransformationService, MockTransformationService, TransformationService};
pub use types::{
    AnalysisDetails, AnalysisOutcome, AnalysisRequest, FilePayload, FinalReport, Measurement,
    MeasurementPair, MutateOutcome, Stage, StartOutcome,
};
