//! Experiment orchestrator: drives one experiment through the five-stage pipeline.
//!
//! Every operation is a guarded transition attempt:
//! 1. reject immediately if another remote call for this experiment is in flight;
//! 2. clear the previous error and validate locally (validation failures never
//!    reach the service);
//! 3. mark the experiment busy and call the service without holding the lock;
//! 4. on completion, discard the response if the experiment was reset meanwhile,
//!    otherwise fold the result into the experiment through the reducer.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ServiceError, TransitionError, ValidationError};
use crate::experiment::{Experiment, ExperimentEvent};
use crate::service::TransformationService;
use crate::types::{AnalysisRequest, FilePayload, Measurement, MeasurementPair, Stage};

/// Callback for observing orchestrator progress (stage changes, surfaced errors).
#[async_trait]
pub trait ExperimentCallback: Send + Sync {
    async fn on_stage_change(&self, experiment: Uuid, from: Stage, to: Stage);

    async fn on_error(&self, experiment: Uuid, message: &str);

    async fn on_reset(&self, _previous: Uuid, _generation: u64) {}
}

/// A callback that ignores everything.
pub struct NoOpCallback;

#[async_trait]
impl ExperimentCallback for NoOpCallback {
    async fn on_stage_change(&self, _experiment: Uuid, _from: Stage, _to: Stage) {}

    async fn on_error(&self, _experiment: Uuid, _message: &str) {}
}

/// Inputs collected for the analysis step. Every field is optional so that a
/// partially filled form can be validated and reported on field by field.
#[derive(Debug, Clone, Default)]
pub struct AnalysisInputs {
    pub original_report: Option<FilePayload>,
    pub variant_report: Option<FilePayload>,
    pub original_rate: Option<f64>,
    pub variant_rate: Option<f64>,
}

impl AnalysisInputs {
    pub fn new(
        original_report: FilePayload,
        variant_report: FilePayload,
        original_rate: f64,
        variant_rate: f64,
    ) -> Self {
        Self {
            original_report: Some(original_report),
            variant_report: Some(variant_report),
            original_rate: Some(original_rate),
            variant_rate: Some(variant_rate),
        }
    }

    /// Check presence and numeric sanity, producing the measurement pair.
    ///
    /// Rates outside 0-100 are passed through untouched (the scoring service
    /// decides what they mean) but are logged.
    pub fn validate(self) -> Result<MeasurementPair, ValidationError> {
        let original_report = present_report(self.original_report, "original")?;
        let variant_report = present_report(self.variant_report, "variant")?;
        let original_rate = present_rate(self.original_rate, "original")?;
        let variant_rate = present_rate(self.variant_rate, "variant")?;
        Ok(MeasurementPair {
            original: Measurement {
                report: original_report,
                detection_rate: original_rate,
            },
            variant: Measurement {
                report: variant_report,
                detection_rate: variant_rate,
            },
        })
    }
}

fn present_report(
    report: Option<FilePayload>,
    which: &'static str,
) -> Result<FilePayload, ValidationError> {
    match report {
        Some(report) if !report.is_empty() => Ok(report),
        _ => Err(ValidationError::MissingReport { which }),
    }
}

fn present_rate(rate: Option<f64>, which: &'static str) -> Result<f64, ValidationError> {
    let rate = rate.ok_or(ValidationError::InvalidRate {
        which,
        value: String::new(),
    })?;
    if !rate.is_finite() {
        return Err(ValidationError::InvalidRate {
            which,
            value: rate.to_string(),
        });
    }
    if !(0.0..=100.0).contains(&rate) {
        warn!(which, rate, "Detection rate outside 0-100, passing through as-is");
    }
    Ok(rate)
}

/// Parse a detection rate typed by the user, e.g. `"62"` or `"11.5"`.
pub fn parse_rate(which: &'static str, input: &str) -> Result<f64, ValidationError> {
    let trimmed = input.trim().trim_end_matches('%').trim();
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|r| r.is_finite())
        .ok_or_else(|| ValidationError::InvalidRate {
            which,
            value: input.to_string(),
        })
}

/// The experiment together with the busy flag, read under one lock.
#[derive(Debug, Clone)]
pub struct OrchestratorStatus {
    pub experiment: Experiment,
    pub busy: bool,
}

struct Session {
    experiment: Experiment,
    /// Generation of the experiment whose remote call is outstanding.
    in_flight: Option<u64>,
}

/// Clears the busy flag when the remote call finishes or its future is dropped.
struct FlightGuard<'a> {
    session: &'a Mutex<Session>,
    generation: u64,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.in_flight == Some(self.generation) {
            session.in_flight = None;
        }
    }
}

/// Drives a single experiment, one transition at a time.
pub struct ExperimentOrchestrator {
    service: Arc<dyn TransformationService>,
    session: Mutex<Session>,
    callback: Arc<dyn ExperimentCallback>,
}

impl ExperimentOrchestrator {
    pub fn new(service: Arc<dyn TransformationService>) -> Self {
        Self::with_callback(service, Arc::new(NoOpCallback))
    }

    pub fn with_callback(
        service: Arc<dyn TransformationService>,
        callback: Arc<dyn ExperimentCallback>,
    ) -> Self {
        Self {
            service,
            session: Mutex::new(Session {
                experiment: Experiment::new(0),
                in_flight: None,
            }),
            callback,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the current experiment.
    pub fn snapshot(&self) -> Experiment {
        self.lock().experiment.clone()
    }

    /// A copy of the current experiment plus whether a call is in flight.
    pub fn status(&self) -> OrchestratorStatus {
        let session = self.lock();
        OrchestratorStatus {
            busy: session.in_flight == Some(session.experiment.generation()),
            experiment: session.experiment.clone(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.lock().experiment.stage()
    }

    /// Whether a remote call for the current experiment is outstanding.
    pub fn is_busy(&self) -> bool {
        let session = self.lock();
        session.in_flight == Some(session.experiment.generation())
    }

    /// Clear the last error and run local validation.
    ///
    /// Returns the experiment as validated. A validation failure is recorded as
    /// the experiment's last error. When `remote` is set the experiment is marked
    /// busy and a guard releasing it is returned alongside.
    fn begin<T>(
        &self,
        remote: bool,
        validate: impl FnOnce(&Experiment) -> Result<T, ValidationError>,
    ) -> Result<(T, Option<FlightGuard<'_>>, Experiment), TransitionError> {
        let mut session = self.lock();
        if session.in_flight == Some(session.experiment.generation()) {
            return Err(TransitionError::Busy);
        }
        let cleared = session
            .experiment
            .clone()
            .apply(ExperimentEvent::AttemptStarted)?;
        session.experiment = cleared;

        match validate(&session.experiment) {
            Ok(value) => {
                let generation = session.experiment.generation();
                let guard = remote.then(|| {
                    session.in_flight = Some(generation);
                    FlightGuard {
                        session: &self.session,
                        generation,
                    }
                });
                Ok((value, guard, session.experiment.clone()))
            }
            Err(err) => {
                session.experiment = session
                    .experiment
                    .clone()
                    .apply(ExperimentEvent::Failed(err.to_string()))?;
                Err(err.into())
            }
        }
    }

    /// Apply `event` if the experiment is still the generation that started the call.
    fn commit(
        &self,
        generation: u64,
        event: ExperimentEvent,
    ) -> Result<Experiment, TransitionError> {
        let mut session = self.lock();
        let current = session.experiment.generation();
        if current != generation {
            warn!(
                started = generation,
                current, "Discarding response for an experiment that was reset"
            );
            return Err(TransitionError::Stale {
                started: generation,
                current,
            });
        }
        let next = session.experiment.clone().apply(event)?;
        session.experiment = next.clone();
        Ok(next)
    }

    /// Record a service failure as the experiment's last error. Returns the error
    /// to hand back to the caller.
    async fn fail(&self, generation: u64, prefix: &str, err: ServiceError) -> TransitionError {
        let message = format!("{prefix}: {err}");
        let exp = match self.commit(generation, ExperimentEvent::Failed(message.clone())) {
            Ok(exp) => exp,
            Err(stale) => return stale,
        };
        warn!(experiment = %exp.id(), stage = %exp.stage(), error = %err, "{prefix}");
        self.callback.on_error(exp.id(), &message).await;
        TransitionError::Service(err)
    }

    async fn notify_validation_failure(&self, err: &TransitionError) {
        if let TransitionError::Validation(v) = err {
            let id = self.lock().experiment.id();
            debug!(experiment = %id, error = %v, "Transition rejected by validation");
            self.callback.on_error(id, &v.to_string()).await;
        }
    }

    async fn advanced(&self, from: Stage, exp: &Experiment) {
        info!(experiment = %exp.id(), from = %from, to = %exp.stage(), "Experiment advanced");
        self.callback
            .on_stage_change(exp.id(), from, exp.stage())
            .await;
    }

    /// Upload the original file. Advances to `AwaitingPerturbationChoice`.
    pub async fn submit_original(&self, file: FilePayload) -> Result<Experiment, TransitionError> {
        let begun = self.begin(true, |exp| {
            exp.require_stage("submitOriginal", Stage::AwaitingUpload)?;
            if file.is_empty() || file.file_name.trim().is_empty() {
                return Err(ValidationError::EmptyFile);
            }
            Ok(())
        });
        let ((), _guard, exp) = match begun {
            Ok(b) => b,
            Err(e) => {
                self.notify_validation_failure(&e).await;
                return Err(e);
            }
        };
        let generation = exp.generation();

        let result = self.service.start(file).await.and_then(|outcome| {
            if outcome.available_perturbations.is_empty() {
                Err(ServiceError::ResponseParse {
                    message: "service offered no perturbation strategies".to_string(),
                })
            } else {
                Ok(outcome)
            }
        });
        match result {
            Ok(outcome) => {
                let next = self.commit(generation, ExperimentEvent::UploadSucceeded(outcome))?;
                self.advanced(exp.stage(), &next).await;
                Ok(next)
            }
            Err(err) => Err(self.fail(generation, "Upload failed", err).await),
        }
    }

    /// Change the selected perturbation without contacting the service.
    pub async fn select_perturbation(&self, choice: &str) -> Result<Experiment, TransitionError> {
        let begun = self.begin(false, |exp| {
            exp.require_stage("selectPerturbation", Stage::AwaitingPerturbationChoice)?;
            exp.require_known_perturbation(choice)
        });
        let ((), _, exp) = match begun {
            Ok(b) => b,
            Err(e) => {
                self.notify_validation_failure(&e).await;
                return Err(e);
            }
        };
        self.commit(
            exp.generation(),
            ExperimentEvent::PerturbationSelected(choice.to_string()),
        )
    }

    /// Ask the service to apply `choice`. Advances to `AwaitingSandboxTest`.
    pub async fn apply_perturbation(&self, choice: &str) -> Result<Experiment, TransitionError> {
        let begun = self.begin(true, |exp| {
            exp.require_stage("applyPerturbation", Stage::AwaitingPerturbationChoice)?;
            exp.require_known_perturbation(choice)?;
            exp.original_artifact_ref()
                .map(str::to_string)
                .ok_or(ValidationError::WrongStage {
                    operation: "applyPerturbation",
                    expected: Stage::AwaitingPerturbationChoice,
                    actual: Stage::AwaitingUpload,
                })
        });
        let (original_ref, _guard, exp) = match begun {
            Ok(b) => b,
            Err(e) => {
                self.notify_validation_failure(&e).await;
                return Err(e);
            }
        };
        let generation = exp.generation();

        match self.service.mutate(&original_ref, choice).await {
            Ok(outcome) => {
                let next = self.commit(
                    generation,
                    ExperimentEvent::MutationSucceeded {
                        perturbation: choice.to_string(),
                        outcome,
                    },
                )?;
                self.advanced(exp.stage(), &next).await;
                Ok(next)
            }
            Err(err) => Err(self.fail(generation, "Mutation failed", err).await),
        }
    }

    /// Apply the currently selected perturbation.
    pub async fn apply_selected_perturbation(&self) -> Result<Experiment, TransitionError> {
        let choice = self
            .snapshot()
            .selected_perturbation()
            .map(str::to_string)
            .unwrap_or_default();
        self.apply_perturbation(&choice).await
    }

    /// Record that the user ran both artifacts in their sandbox. Purely local;
    /// the claim is taken on trust.
    pub async fn acknowledge_sandbox_testing(&self) -> Result<Experiment, TransitionError> {
        let begun = self.begin(false, |exp| {
            exp.require_stage("acknowledgeSandboxTesting", Stage::AwaitingSandboxTest)
        });
        let ((), _, exp) = match begun {
            Ok(b) => b,
            Err(e) => {
                self.notify_validation_failure(&e).await;
                return Err(e);
            }
        };
        let next = self.commit(exp.generation(), ExperimentEvent::SandboxAcknowledged)?;
        self.advanced(exp.stage(), &next).await;
        Ok(next)
    }

    /// Submit both reports and detection rates for scoring. Advances to `Complete`.
    pub async fn submit_analysis(
        &self,
        inputs: AnalysisInputs,
    ) -> Result<Experiment, TransitionError> {
        let begun = self.begin(true, |exp| {
            exp.require_stage("submitAnalysis", Stage::AwaitingAnalysisInputs)?;
            let variant_ref = exp
                .variant_artifact_ref()
                .ok_or(ValidationError::VariantUnavailable)?
                .to_string();
            let original_ref = exp
                .original_artifact_ref()
                .map(str::to_string)
                .ok_or(ValidationError::VariantUnavailable)?;
            let measurements = inputs.validate()?;
            Ok(AnalysisRequest {
                measurements,
                original_artifact_ref: original_ref,
                variant_artifact_ref: variant_ref,
            })
        });
        let (request, _guard, exp) = match begun {
            Ok(b) => b,
            Err(e) => {
                self.notify_validation_failure(&e).await;
                return Err(e);
            }
        };
        let generation = exp.generation();
        let measurements = request.measurements.clone();

        match self.service.analyze(request).await {
            Ok(outcome) => {
                let next = self.commit(
                    generation,
                    ExperimentEvent::AnalysisSucceeded {
                        measurements,
                        outcome,
                    },
                )?;
                self.advanced(exp.stage(), &next).await;
                Ok(next)
            }
            Err(err) => Err(self.fail(generation, "Analysis failed", err).await),
        }
    }

    /// Fetch the produced variant. Does not change the stage.
    pub async fn download_variant(&self) -> Result<Bytes, TransitionError> {
        let begun = self.begin(true, |exp| {
            exp.variant_download_location()
                .map(str::to_string)
                .ok_or(ValidationError::VariantUnavailable)
        });
        let (location, _guard, exp) = match begun {
            Ok(b) => b,
            Err(e) => {
                self.notify_validation_failure(&e).await;
                return Err(e);
            }
        };
        let generation = exp.generation();

        match self.service.download(&location).await {
            Ok(bytes) => {
                let current = self.lock().experiment.generation();
                if current != generation {
                    warn!(
                        started = generation,
                        current, "Discarding download for a reset experiment"
                    );
                    return Err(TransitionError::Stale {
                        started: generation,
                        current,
                    });
                }
                debug!(experiment = %exp.id(), size = bytes.len(), "Variant downloaded");
                Ok(bytes)
            }
            Err(err) => Err(self.fail(generation, "Download failed", err).await),
        }
    }

    /// Discard the current experiment and start a fresh one. Always succeeds,
    /// even while a call is in flight; that call's response will be discarded.
    pub async fn reset(&self) -> Experiment {
        let (previous, fresh) = {
            let mut session = self.lock();
            let previous = session.experiment.id();
            session.experiment = session.experiment.reset();
            session.in_flight = None;
            (previous, session.experiment.clone())
        };
        info!(previous = %previous, generation = fresh.generation(), "Experiment reset");
        self.callback.on_reset(previous, fresh.generation()).await;
        fresh
    }
}
