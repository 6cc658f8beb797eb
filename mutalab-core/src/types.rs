//! Core types shared by the orchestrator and the service client.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline position of an experiment.
///
/// Variants are declared in pipeline order, so the derived `Ord` matches the
/// order in which an experiment moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    AwaitingUpload,
    AwaitingPerturbationChoice,
    AwaitingSandboxTest,
    AwaitingAnalysisInputs,
    Complete,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::AwaitingUpload,
        Stage::AwaitingPerturbationChoice,
        Stage::AwaitingSandboxTest,
        Stage::AwaitingAnalysisInputs,
        Stage::Complete,
    ];

    /// The stage reached by a successful exit action, or `None` for `Complete`.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::AwaitingUpload => Some(Stage::AwaitingPerturbationChoice),
            Stage::AwaitingPerturbationChoice => Some(Stage::AwaitingSandboxTest),
            Stage::AwaitingSandboxTest => Some(Stage::AwaitingAnalysisInputs),
            Stage::AwaitingAnalysisInputs => Some(Stage::Complete),
            Stage::Complete => None,
        }
    }

    /// One-based step number, as shown in progress indicators.
    pub fn step_number(self) -> usize {
        self as usize + 1
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::Complete
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::AwaitingUpload => write!(f, "awaiting upload"),
            Stage::AwaitingPerturbationChoice => write!(f, "awaiting perturbation choice"),
            Stage::AwaitingSandboxTest => write!(f, "awaiting sandbox test"),
            Stage::AwaitingAnalysisInputs => write!(f, "awaiting analysis inputs"),
            Stage::Complete => write!(f, "complete"),
        }
    }
}

/// A named binary payload: an uploaded executable or a sandbox report document.
///
/// The content is reference-counted, so cloning a payload does not copy the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub file_name: String,
    pub content: Bytes,
}

impl FilePayload {
    pub fn new(file_name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            content: content.into(),
        }
    }

    /// Read a payload from disk, naming it after the path's final component.
    pub async fn from_path(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        Ok(Self::new(file_name, content))
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

impl fmt::Debug for FilePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePayload")
            .field("file_name", &self.file_name)
            .field("len", &self.content.len())
            .finish()
    }
}

/// Result of the remote `start` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartOutcome {
    pub original_artifact_ref: String,
    pub available_perturbations: Vec<String>,
    pub recommended_perturbation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Result of the remote `mutate` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutateOutcome {
    pub variant_artifact_ref: String,
    pub variant_download_location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_size_bytes: Option<u64>,
    /// Whether the service could still parse the variant as a valid executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_valid: Option<bool>,
}

/// One side of the measurement pair: a sandbox report plus the detection rate
/// the user read off the scanner, in percent.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub report: FilePayload,
    pub detection_rate: f64,
}

/// Measurements for the original and the variant.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementPair {
    pub original: Measurement,
    pub variant: Measurement,
}

/// Everything the remote `analyze` operation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub measurements: MeasurementPair,
    pub original_artifact_ref: String,
    pub variant_artifact_ref: String,
}

/// Scored outcome of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub fitness: f64,
    pub vt_reduction_percent: f64,
    /// Fuzzy-hash similarity distance on a 0-100 scale.
    pub ssdeep_distance: f64,
    pub is_functional: bool,
    pub behavioral_overlap_percent: f64,
}

impl fmt::Display for FinalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Fitness score:      {:.4}", self.fitness)?;
        writeln!(f, "Reduction:          -{:.1}%", self.vt_reduction_percent)?;
        writeln!(f, "Similarity:         {}/100", self.ssdeep_distance)?;
        writeln!(
            f,
            "Functional status:  {}",
            if self.is_functional {
                "Functional (Pass)"
            } else {
                "Broken (Fail)"
            }
        )?;
        write!(
            f,
            "Behavioral overlap: {:.1}%",
            self.behavioral_overlap_percent
        )
    }
}

/// Secondary scoring data the service returns alongside the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisDetails {
    /// Detection rates as fractions (0.0-1.0).
    pub vt_original: Option<f64>,
    pub vt_variant: Option<f64>,
    pub vt_reduction: Option<f64>,
    pub weight_vt: Option<f64>,
    pub weight_ssdeep: Option<f64>,
    #[serde(default)]
    pub signatures_original: Vec<String>,
    #[serde(default)]
    pub signatures_variant: Vec<String>,
}

/// Result of the remote `analyze` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub report: FinalReport,
    #[serde(default)]
    pub details: AnalysisDetails,
}
