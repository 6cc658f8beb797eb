//! Plain-text rendering of experiment progress and results.

use mutalab_core::error::{ServiceError, TransitionError};
use mutalab_core::experiment::Experiment;
use mutalab_core::types::Stage;

/// Short label for each stage, as shown in the progress line.
pub fn stage_label(stage: Stage) -> &'static str {
    match stage {
        Stage::AwaitingUpload => "Upload",
        Stage::AwaitingPerturbationChoice => "Perturb",
        Stage::AwaitingSandboxTest => "Sandbox",
        Stage::AwaitingAnalysisInputs => "Analyze",
        Stage::Complete => "Results",
    }
}

/// What the user is asked to do at a stage.
pub fn stage_instruction(stage: Stage) -> &'static str {
    match stage {
        Stage::AwaitingUpload => "Upload the original executable",
        Stage::AwaitingPerturbationChoice => "Choose a perturbation strategy",
        Stage::AwaitingSandboxTest => "Download the variant and run both files in your sandbox",
        Stage::AwaitingAnalysisInputs => "Submit both sandbox reports and detection rates",
        Stage::Complete => "Experiment complete",
    }
}

/// `Step 2/5: Choose a perturbation strategy`
pub fn step_header(stage: Stage) -> String {
    format!(
        "Step {}/{}: {}",
        stage.step_number(),
        Stage::ALL.len(),
        stage_instruction(stage)
    )
}

/// `[x] Upload  [>] Perturb  [ ] Sandbox  [ ] Analyze  [ ] Results`
pub fn progress_line(current: Stage) -> String {
    Stage::ALL
        .iter()
        .map(|&stage| {
            let mark = if stage < current || current.is_terminal() {
                "x"
            } else if stage == current {
                ">"
            } else {
                " "
            };
            format!("[{}] {}", mark, stage_label(stage))
        })
        .collect::<Vec<_>>()
        .join("  ")
}

/// One-line description of a failed transition, with a hint where one helps.
pub fn error_line(err: &TransitionError) -> String {
    match err {
        TransitionError::Service(ServiceError::AuthFailed)
        | TransitionError::Service(ServiceError::Token(_)) => {
            format!("{} (run `mutalab auth login`)", err)
        }
        TransitionError::Service(ServiceError::Connection { .. }) => {
            format!("{} (is the service running? see `mutalab config show`)", err)
        }
        _ => err.to_string(),
    }
}

/// Full results block for a completed experiment.
pub fn results(exp: &Experiment) -> String {
    let Some(report) = exp.final_report() else {
        return "No results yet.".to_string();
    };
    let mut out = String::new();
    out.push_str(&report.to_string());
    out.push('\n');
    out.push_str(&format!(
        "\nExperiment:         {} (started {}, took {}s)\n",
        exp.id(),
        exp.created_at().format("%Y-%m-%d %H:%M:%S UTC"),
        (exp.updated_at() - exp.created_at()).num_seconds()
    ));

    if let Some(variant) = exp.variant() {
        out.push_str(&format!("\nPerturbation:       {}\n", variant.perturbation));
        if let Some(md5) = &variant.md5 {
            out.push_str(&format!("Variant MD5:        {}\n", md5));
        }
    }
    if let Some(m) = exp.measurements() {
        out.push_str(&format!(
            "Detection rates:    {}% -> {}%\n",
            m.original.detection_rate, m.variant.detection_rate
        ));
    }
    if let Some(details) = exp.analysis_details()
        && (!details.signatures_original.is_empty() || !details.signatures_variant.is_empty())
    {
        let lost: Vec<&str> = details
            .signatures_original
            .iter()
            .filter(|s| !details.signatures_variant.contains(s))
            .map(String::as_str)
            .collect();
        out.push_str(&format!(
            "Signatures:         {} original, {} variant\n",
            details.signatures_original.len(),
            details.signatures_variant.len()
        ));
        if !lost.is_empty() {
            out.push_str(&format!("Signatures lost:    {}\n", lost.join(", ")));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutalab_core::error::ValidationError;
    use mutalab_core::experiment::ExperimentEvent;
    use mutalab_core::types::{
        AnalysisDetails, AnalysisOutcome, FilePayload, FinalReport, Measurement,
        MeasurementPair, MutateOutcome, StartOutcome,
    };
    use pretty_assertions::assert_eq;

    fn complete_experiment() -> Experiment {
        Experiment::new(0)
            .apply(ExperimentEvent::UploadSucceeded(StartOutcome {
                original_artifact_ref: "o".into(),
                available_perturbations: vec!["section_append".into()],
                recommended_perturbation: "section_append".into(),
                md5: None,
                size_bytes: None,
            }))
            .unwrap()
            .apply(ExperimentEvent::MutationSucceeded {
                perturbation: "section_append".into(),
                outcome: MutateOutcome {
                    variant_artifact_ref: "v".into(),
                    variant_download_location: "/media/v.bin".into(),
                    variant_md5: Some("abc".into()),
                    variant_size_bytes: None,
                    is_valid: Some(true),
                },
            })
            .unwrap()
            .apply(ExperimentEvent::SandboxAcknowledged)
            .unwrap()
            .apply(ExperimentEvent::AnalysisSucceeded {
                measurements: MeasurementPair {
                    original: Measurement {
                        report: FilePayload::new("o.xlsx", b"o".to_vec()),
                        detection_rate: 62.0,
                    },
                    variant: Measurement {
                        report: FilePayload::new("v.xlsx", b"v".to_vec()),
                        detection_rate: 11.0,
                    },
                },
                outcome: AnalysisOutcome {
                    report: FinalReport {
                        fitness: 0.8123,
                        vt_reduction_percent: 82.26,
                        ssdeep_distance: 74.0,
                        is_functional: true,
                        behavioral_overlap_percent: 91.2,
                    },
                    details: AnalysisDetails {
                        signatures_original: vec!["creates_exe".into(), "network_http".into()],
                        signatures_variant: vec!["creates_exe".into()],
                        ..Default::default()
                    },
                },
            })
            .unwrap()
    }

    #[test]
    fn test_step_header() {
        assert_eq!(
            step_header(Stage::AwaitingPerturbationChoice),
            "Step 2/5: Choose a perturbation strategy"
        );
    }

    #[test]
    fn test_progress_line_marks_current() {
        assert_eq!(
            progress_line(Stage::AwaitingSandboxTest),
            "[x] Upload  [x] Perturb  [>] Sandbox  [ ] Analyze  [ ] Results"
        );
        assert_eq!(
            progress_line(Stage::Complete),
            "[x] Upload  [x] Perturb  [x] Sandbox  [x] Analyze  [x] Results"
        );
    }

    #[test]
    fn test_error_line_hints_login() {
        let err = TransitionError::Service(ServiceError::AuthFailed);
        assert!(error_line(&err).contains("mutalab auth login"));
        let err = TransitionError::Validation(ValidationError::EmptyFile);
        assert_eq!(error_line(&err), "Please select a file.");
    }

    #[test]
    fn test_results_block() {
        let out = results(&complete_experiment());
        assert!(out.contains("Fitness score:      0.8123"));
        assert!(out.contains("Reduction:          -82.3%"));
        assert!(out.contains("Functional (Pass)"));
        assert!(out.contains("Perturbation:       section_append"));
        assert!(out.contains("Detection rates:    62% -> 11%"));
        assert!(out.contains("Signatures lost:    network_http"));
    }

    #[test]
    fn test_results_block_identifies_experiment() {
        let exp = complete_experiment();
        let out = results(&exp);
        let expected = format!(
            "Experiment:         {} (started {}",
            exp.id(),
            exp.created_at().format("%Y-%m-%d %H:%M:%S UTC")
        );
        assert!(out.contains(&expected));
        assert!(out.contains("took 0s)"));
    }

    #[test]
    fn test_results_before_completion() {
        assert_eq!(results(&Experiment::new(0)), "No results yet.");
    }
}
