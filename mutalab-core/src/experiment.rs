//! Experiment state and its pure reducer.
//!
//! An [`Experiment`] only changes through [`Experiment::apply`], which takes the
//! current value and an [`ExperimentEvent`] and returns the next value. The
//! reducer knows nothing about the network: the orchestrator performs remote
//! calls and feeds their results back in as events. Either every field a stage
//! owns is set by one event, or the experiment is left exactly as it was.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::types::{
    AnalysisDetails, AnalysisOutcome, FinalReport, MeasurementPair, MutateOutcome, Stage,
    StartOutcome,
};

/// The uploaded original, as tracked by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginalArtifact {
    pub artifact_ref: String,
    pub md5: Option<String>,
    pub size_bytes: Option<u64>,
}

/// The variant produced by a perturbation.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantArtifact {
    pub artifact_ref: String,
    pub download_location: String,
    pub perturbation: String,
    pub md5: Option<String>,
    pub size_bytes: Option<u64>,
    pub is_valid: Option<bool>,
}

/// Inputs to the reducer.
#[derive(Debug, Clone)]
pub enum ExperimentEvent {
    /// A transition attempt begins; clears the previous error.
    AttemptStarted,
    UploadSucceeded(StartOutcome),
    PerturbationSelected(String),
    MutationSucceeded {
        perturbation: String,
        outcome: MutateOutcome,
    },
    SandboxAcknowledged,
    AnalysisSucceeded {
        measurements: MeasurementPair,
        outcome: AnalysisOutcome,
    },
    /// A transition attempt failed; only the user-facing message is recorded.
    Failed(String),
}

impl ExperimentEvent {
    fn name(&self) -> &'static str {
        match self {
            ExperimentEvent::AttemptStarted => "attemptStarted",
            ExperimentEvent::UploadSucceeded(_) => "submitOriginal",
            ExperimentEvent::PerturbationSelected(_) => "selectPerturbation",
            ExperimentEvent::MutationSucceeded { .. } => "applyPerturbation",
            ExperimentEvent::SandboxAcknowledged => "acknowledgeSandboxTesting",
            ExperimentEvent::AnalysisSucceeded { .. } => "submitAnalysis",
            ExperimentEvent::Failed(_) => "failed",
        }
    }
}

/// The single mutable aggregate for one user session.
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    id: Uuid,
    generation: u64,
    stage: Stage,
    original: Option<OriginalArtifact>,
    available_perturbations: Vec<String>,
    recommended_perturbation: Option<String>,
    selected_perturbation: Option<String>,
    variant: Option<VariantArtifact>,
    measurements: Option<MeasurementPair>,
    final_report: Option<FinalReport>,
    analysis_details: Option<AnalysisDetails>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Default for Experiment {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Experiment {
    /// Create a fresh experiment waiting for an upload.
    pub fn new(generation: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            generation,
            stage: Stage::AwaitingUpload,
            original: None,
            available_perturbations: Vec::new(),
            recommended_perturbation: None,
            selected_perturbation: None,
            variant: None,
            measurements: None,
            final_report: None,
            analysis_details: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Discard this experiment and start over. The replacement carries the next
    /// generation number so late responses for this one can be recognised.
    pub fn reset(&self) -> Self {
        Self::new(self.generation + 1)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn original(&self) -> Option<&OriginalArtifact> {
        self.original.as_ref()
    }

    pub fn original_artifact_ref(&self) -> Option<&str> {
        self.original.as_ref().map(|o| o.artifact_ref.as_str())
    }

    pub fn available_perturbations(&self) -> &[String] {
        &self.available_perturbations
    }

    pub fn recommended_perturbation(&self) -> Option<&str> {
        self.recommended_perturbation.as_deref()
    }

    pub fn selected_perturbation(&self) -> Option<&str> {
        self.selected_perturbation.as_deref()
    }

    pub fn variant(&self) -> Option<&VariantArtifact> {
        self.variant.as_ref()
    }

    pub fn variant_artifact_ref(&self) -> Option<&str> {
        self.variant.as_ref().map(|v| v.artifact_ref.as_str())
    }

    pub fn variant_download_location(&self) -> Option<&str> {
        self.variant.as_ref().map(|v| v.download_location.as_str())
    }

    pub fn measurements(&self) -> Option<&MeasurementPair> {
        self.measurements.as_ref()
    }

    pub fn final_report(&self) -> Option<&FinalReport> {
        self.final_report.as_ref()
    }

    pub fn analysis_details(&self) -> Option<&AnalysisDetails> {
        self.analysis_details.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Fail with `WrongStage` unless the experiment is at `expected`.
    pub fn require_stage(
        &self,
        operation: &'static str,
        expected: Stage,
    ) -> Result<(), ValidationError> {
        if self.stage == expected {
            Ok(())
        } else {
            Err(ValidationError::WrongStage {
                operation,
                expected,
                actual: self.stage,
            })
        }
    }

    /// Fail with `UnknownPerturbation` unless `choice` was offered by the service.
    pub fn require_known_perturbation(&self, choice: &str) -> Result<(), ValidationError> {
        if self.available_perturbations.iter().any(|p| p == choice) {
            Ok(())
        } else {
            Err(ValidationError::UnknownPerturbation {
                choice: choice.to_string(),
            })
        }
    }

    /// Apply an event, producing the next experiment value.
    ///
    /// On error the experiment is consumed; callers that need to keep the old value
    /// apply events to a clone.
    pub fn apply(mut self, event: ExperimentEvent) -> Result<Self, ValidationError> {
        let operation = event.name();
        match event {
            ExperimentEvent::AttemptStarted => {
                self.last_error = None;
            }
            ExperimentEvent::Failed(message) => {
                self.last_error = Some(message);
            }
            ExperimentEvent::UploadSucceeded(outcome) => {
                self.require_stage(operation, Stage::AwaitingUpload)?;
                let selected = if outcome
                    .available_perturbations
                    .contains(&outcome.recommended_perturbation)
                {
                    Some(outcome.recommended_perturbation.clone())
                } else {
                    outcome.available_perturbations.first().cloned()
                };
                self.original = Some(OriginalArtifact {
                    artifact_ref: outcome.original_artifact_ref,
                    md5: outcome.md5,
                    size_bytes: outcome.size_bytes,
                });
                self.available_perturbations = outcome.available_perturbations;
                self.recommended_perturbation = Some(outcome.recommended_perturbation);
                self.selected_perturbation = selected;
                self.stage = Stage::AwaitingPerturbationChoice;
            }
            ExperimentEvent::PerturbationSelected(choice) => {
                self.require_stage(operation, Stage::AwaitingPerturbationChoice)?;
                self.require_known_perturbation(&choice)?;
                self.selected_perturbation = Some(choice);
            }
            ExperimentEvent::MutationSucceeded {
                perturbation,
                outcome,
            } => {
                self.require_stage(operation, Stage::AwaitingPerturbationChoice)?;
                self.require_known_perturbation(&perturbation)?;
                self.selected_perturbation = Some(perturbation.clone());
                self.variant = Some(VariantArtifact {
                    artifact_ref: outcome.variant_artifact_ref,
                    download_location: outcome.variant_download_location,
                    perturbation,
                    md5: outcome.variant_md5,
                    size_bytes: outcome.variant_size_bytes,
                    is_valid: outcome.is_valid,
                });
                self.stage = Stage::AwaitingSandboxTest;
            }
            ExperimentEvent::SandboxAcknowledged => {
                self.require_stage(operation, Stage::AwaitingSandboxTest)?;
                self.stage = Stage::AwaitingAnalysisInputs;
            }
            ExperimentEvent::AnalysisSucceeded {
                measurements,
                outcome,
            } => {
                self.require_stage(operation, Stage::AwaitingAnalysisInputs)?;
                self.measurements = Some(measurements);
                self.final_report = Some(outcome.report);
                self.analysis_details = Some(outcome.details);
                self.stage = Stage::Complete;
            }
        }
        self.updated_at = Utc::now();
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FilePayload, Measurement};
    use pretty_assertions::assert_eq;

    fn start_outcome() -> StartOutcome {
        StartOutcome {
            original_artifact_ref: "orig-1".into(),
            available_perturbations: vec!["section_append".into(), "packer_a".into()],
            recommended_perturbation: "section_append".into(),
            md5: Some("d41d8cd98f00b204e9800998ecf8427e".into()),
            size_bytes: Some(1024),
        }
    }

    fn mutate_outcome() -> MutateOutcome {
        MutateOutcome {
            variant_artifact_ref: "var-1".into(),
            variant_download_location: "/files/var-1".into(),
            variant_md5: None,
            variant_size_bytes: None,
            is_valid: Some(true),
        }
    }

    fn measurements() -> MeasurementPair {
        MeasurementPair {
            original: Measurement {
                report: FilePayload::new("orig.xlsx", b"orig".to_vec()),
                detection_rate: 62.0,
            },
            variant: Measurement {
                report: FilePayload::new("var.xlsx", b"var".to_vec()),
                detection_rate: 11.0,
            },
        }
    }

    fn analysis_outcome() -> AnalysisOutcome {
        AnalysisOutcome {
            report: FinalReport {
                fitness: 0.82,
                vt_reduction_percent: 82.3,
                ssdeep_distance: 74.0,
                is_functional: true,
                behavioral_overlap_percent: 91.2,
            },
            details: AnalysisDetails::default(),
        }
    }

    fn at_analysis_inputs() -> Experiment {
        Experiment::new(0)
            .apply(ExperimentEvent::UploadSucceeded(start_outcome()))
            .unwrap()
            .apply(ExperimentEvent::MutationSucceeded {
                perturbation: "packer_a".into(),
                outcome: mutate_outcome(),
            })
            .unwrap()
            .apply(ExperimentEvent::SandboxAcknowledged)
            .unwrap()
    }

    #[test]
    fn test_new_experiment_is_empty() {
        let exp = Experiment::new(3);
        assert_eq!(exp.stage(), Stage::AwaitingUpload);
        assert_eq!(exp.generation(), 3);
        assert!(exp.original().is_none());
        assert!(exp.available_perturbations().is_empty());
        assert!(exp.selected_perturbation().is_none());
        assert!(exp.variant().is_none());
        assert!(exp.final_report().is_none());
        assert!(exp.last_error().is_none());
    }

    #[test]
    fn test_upload_selects_recommendation() {
        let exp = Experiment::new(0)
            .apply(ExperimentEvent::UploadSucceeded(start_outcome()))
            .unwrap();
        assert_eq!(exp.stage(), Stage::AwaitingPerturbationChoice);
        assert_eq!(exp.original_artifact_ref(), Some("orig-1"));
        assert_eq!(exp.recommended_perturbation(), Some("section_append"));
        assert_eq!(exp.selected_perturbation(), Some("section_append"));
        assert_eq!(exp.original().unwrap().size_bytes, Some(1024));
    }

    #[test]
    fn test_upload_with_unlisted_recommendation_falls_back_to_first() {
        let mut outcome = start_outcome();
        outcome.recommended_perturbation = "generic_append".into();
        let exp = Experiment::new(0)
            .apply(ExperimentEvent::UploadSucceeded(outcome))
            .unwrap();
        assert_eq!(exp.recommended_perturbation(), Some("generic_append"));
        assert_eq!(exp.selected_perturbation(), Some("section_append"));
    }

    #[test]
    fn test_select_unknown_perturbation_rejected() {
        let exp = Experiment::new(0)
            .apply(ExperimentEvent::UploadSucceeded(start_outcome()))
            .unwrap();
        let err = exp
            .clone()
            .apply(ExperimentEvent::PerturbationSelected("upx".into()))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownPerturbation {
                choice: "upx".into()
            }
        );
        let exp = exp
            .apply(ExperimentEvent::PerturbationSelected("packer_a".into()))
            .unwrap();
        assert_eq!(exp.selected_perturbation(), Some("packer_a"));
    }

    #[test]
    fn test_mutation_records_variant() {
        let exp = Experiment::new(0)
            .apply(ExperimentEvent::UploadSucceeded(start_outcome()))
            .unwrap()
            .apply(ExperimentEvent::MutationSucceeded {
                perturbation: "packer_a".into(),
                outcome: mutate_outcome(),
            })
            .unwrap();
        assert_eq!(exp.stage(), Stage::AwaitingSandboxTest);
        assert_eq!(exp.variant_artifact_ref(), Some("var-1"));
        assert_eq!(exp.variant_download_location(), Some("/files/var-1"));
        assert_eq!(exp.selected_perturbation(), Some("packer_a"));
        assert_eq!(exp.variant().unwrap().perturbation, "packer_a");
    }

    #[test]
    fn test_full_pipeline_reaches_complete() {
        let exp = at_analysis_inputs()
            .apply(ExperimentEvent::AnalysisSucceeded {
                measurements: measurements(),
                outcome: analysis_outcome(),
            })
            .unwrap();
        assert_eq!(exp.stage(), Stage::Complete);
        assert_eq!(exp.final_report(), Some(&analysis_outcome().report));
        assert_eq!(exp.measurements().unwrap().variant.detection_rate, 11.0);
    }

    #[test]
    fn test_out_of_stage_events_rejected() {
        let fresh = Experiment::new(0);
        for event in [
            ExperimentEvent::PerturbationSelected("packer_a".into()),
            ExperimentEvent::MutationSucceeded {
                perturbation: "packer_a".into(),
                outcome: mutate_outcome(),
            },
            ExperimentEvent::SandboxAcknowledged,
            ExperimentEvent::AnalysisSucceeded {
                measurements: measurements(),
                outcome: analysis_outcome(),
            },
        ] {
            let err = fresh.clone().apply(event).unwrap_err();
            assert!(matches!(
                err,
                ValidationError::WrongStage {
                    actual: Stage::AwaitingUpload,
                    ..
                }
            ));
        }

        let complete = at_analysis_inputs()
            .apply(ExperimentEvent::AnalysisSucceeded {
                measurements: measurements(),
                outcome: analysis_outcome(),
            })
            .unwrap();
        let err = complete
            .apply(ExperimentEvent::UploadSucceeded(start_outcome()))
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::WrongStage {
                expected: Stage::AwaitingUpload,
                actual: Stage::Complete,
                ..
            }
        ));
    }

    #[test]
    fn test_failure_only_touches_last_error() {
        let before = Experiment::new(0)
            .apply(ExperimentEvent::UploadSucceeded(start_outcome()))
            .unwrap();
        let after = before
            .clone()
            .apply(ExperimentEvent::Failed("Mutation failed: boom".into()))
            .unwrap();
        assert_eq!(after.last_error(), Some("Mutation failed: boom"));
        assert_eq!(after.stage(), before.stage());
        assert_eq!(after.variant(), before.variant());
        assert_eq!(after.selected_perturbation(), before.selected_perturbation());

        let cleared = after.apply(ExperimentEvent::AttemptStarted).unwrap();
        assert!(cleared.last_error().is_none());
    }

    #[test]
    fn test_apply_advances_updated_at_only() {
        let exp = Experiment::new(0);
        let created = exp.created_at();
        assert_eq!(exp.updated_at(), created);
        let next = exp
            .apply(ExperimentEvent::Failed("Upload failed: refused".into()))
            .unwrap();
        assert_eq!(next.created_at(), created);
        assert!(next.updated_at() >= created);
    }

    #[test]
    fn test_reset_bumps_generation_and_clears() {
        let exp = at_analysis_inputs();
        let fresh = exp.reset();
        assert_eq!(fresh.generation(), exp.generation() + 1);
        assert_ne!(fresh.id(), exp.id());
        assert_eq!(fresh.stage(), Stage::AwaitingUpload);
        assert!(fresh.original().is_none());
        assert!(fresh.variant().is_none());
        assert!(fresh.measurements().is_none());
    }
}
