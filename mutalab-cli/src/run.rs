//! Guided experiment: drives the orchestrator through all five stages.
//!
//! Values passed as flags are used first. When a step fails, an interactive
//! session offers to try again (re-prompting for the value). Otherwise the run
//! stops with the error.

use async_trait::async_trait;
use dialoguer::{Confirm, Input, Select};
use mutalab_core::config::MutalabConfig;
use mutalab_core::orchestrator::{
    AnalysisInputs, ExperimentCallback, ExperimentOrchestrator, parse_rate,
};
use mutalab_core::service::HttpTransformationService;
use mutalab_core::types::{FilePayload, Stage};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::RunArgs;
use crate::commands;
use crate::render;

/// Prints progress as the experiment advances.
struct TerminalCallback {
    quiet: bool,
}

#[async_trait]
impl ExperimentCallback for TerminalCallback {
    async fn on_stage_change(&self, _experiment: Uuid, _from: Stage, to: Stage) {
        if self.quiet {
            return;
        }
        println!();
        println!("{}", render::progress_line(to));
        if !to.is_terminal() {
            println!("{}", render::step_header(to));
        }
    }

    async fn on_error(&self, experiment: Uuid, message: &str) {
        debug!(experiment = %experiment, message, "Step failed");
    }
}

/// Terminal interaction, degraded to defaults when stdin is not a terminal.
struct Prompt {
    interactive: bool,
    assume_yes: bool,
}

impl Prompt {
    fn new(assume_yes: bool) -> Self {
        Self {
            interactive: std::io::stdin().is_terminal(),
            assume_yes,
        }
    }

    fn text(&self, label: &str, flag: &str) -> anyhow::Result<String> {
        if !self.interactive {
            anyhow::bail!("{} is required when not running interactively (pass {})", label, flag);
        }
        Ok(Input::<String>::new().with_prompt(label).interact_text()?)
    }

    fn path(&self, label: &str, flag: &str) -> anyhow::Result<PathBuf> {
        self.text(label, flag).map(|p| PathBuf::from(p.trim()))
    }

    fn path_with_default(&self, label: &str, default: &Path) -> anyhow::Result<PathBuf> {
        if self.assume_yes || !self.interactive {
            return Ok(default.to_path_buf());
        }
        let input = Input::<String>::new()
            .with_prompt(label)
            .default(default.display().to_string())
            .interact_text()?;
        Ok(PathBuf::from(input.trim()))
    }

    fn confirm(&self, label: &str, default: bool) -> anyhow::Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        if !self.interactive {
            return Ok(default);
        }
        Ok(Confirm::new()
            .with_prompt(label)
            .default(default)
            .interact()?)
    }

    fn select(&self, label: &str, items: &[String], default: usize) -> anyhow::Result<usize> {
        if self.assume_yes || !self.interactive {
            return Ok(default);
        }
        Ok(Select::new()
            .with_prompt(label)
            .items(items)
            .default(default)
            .interact()?)
    }

    /// Report a failed step. Returns `Ok` when the user wants another attempt.
    fn retry_or_bail(&self, message: String) -> anyhow::Result<()> {
        eprintln!("  {}", message);
        if self.assume_yes || !self.interactive {
            anyhow::bail!(message);
        }
        if Confirm::new()
            .with_prompt("Try again?")
            .default(true)
            .interact()?
        {
            Ok(())
        } else {
            anyhow::bail!("Experiment abandoned: {}", message)
        }
    }
}

/// File name for a downloaded variant: the last path segment of its location.
pub fn variant_file_name(location: &str) -> String {
    location
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("variant.bin")
        .to_string()
}

/// Menu entries for the perturbation choice, flagging the recommendation.
pub fn perturbation_labels(available: &[String], recommended: Option<&str>) -> Vec<String> {
    available
        .iter()
        .map(|p| {
            if Some(p.as_str()) == recommended {
                format!("{} (recommended)", p)
            } else {
                p.clone()
            }
        })
        .collect()
}

pub async fn run_experiment(
    args: RunArgs,
    config: MutalabConfig,
    quiet: bool,
) -> anyhow::Result<()> {
    let tokens = commands::token_provider(&config);
    let service = HttpTransformationService::from_config(&config, tokens)?;
    info!(base_url = %service.base_url(), "Starting experiment");

    let callback = Arc::new(TerminalCallback { quiet });
    let orch = ExperimentOrchestrator::with_callback(Arc::new(service), callback);
    let prompt = Prompt::new(args.yes);

    if !quiet {
        println!("{}", render::progress_line(orch.stage()));
        println!("{}", render::step_header(orch.stage()));
    }

    upload(&orch, &prompt, args.file).await?;
    perturb(&orch, &prompt, args.perturbation).await?;
    download(&orch, &prompt, args.download_to).await?;
    if !acknowledge(&orch, &prompt).await? {
        return Ok(());
    }
    analyze(
        &orch,
        &prompt,
        AnalysisFlags {
            original_report: args.original_report,
            variant_report: args.variant_report,
            original_rate: args.original_rate,
            variant_rate: args.variant_rate,
        },
    )
    .await?;

    println!();
    println!("{}", render::results(&orch.snapshot()));
    Ok(())
}

async fn upload(
    orch: &ExperimentOrchestrator,
    prompt: &Prompt,
    mut preset: Option<PathBuf>,
) -> anyhow::Result<()> {
    loop {
        let path = match preset.take() {
            Some(p) => p,
            None => prompt.path("Executable to upload", "--file")?,
        };
        let file = match FilePayload::from_path(&path).await {
            Ok(f) => f,
            Err(e) => {
                prompt.retry_or_bail(format!("Cannot read {}: {}", path.display(), e))?;
                continue;
            }
        };
        match orch.submit_original(file).await {
            Ok(exp) => {
                if let Some(original) = exp.original()
                    && let Some(md5) = &original.md5
                {
                    println!("  Uploaded {} (md5 {})", path.display(), md5);
                }
                return Ok(());
            }
            Err(e) => prompt.retry_or_bail(render::error_line(&e))?,
        }
    }
}

async fn perturb(
    orch: &ExperimentOrchestrator,
    prompt: &Prompt,
    mut preset: Option<String>,
) -> anyhow::Result<()> {
    let exp = orch.snapshot();
    let available = exp.available_perturbations().to_vec();
    let labels = perturbation_labels(&available, exp.recommended_perturbation());

    loop {
        let choice = match preset.take() {
            Some(c) => c,
            None => {
                let current = orch.snapshot();
                let default = current
                    .selected_perturbation()
                    .and_then(|s| available.iter().position(|p| p == s))
                    .unwrap_or(0);
                let idx = prompt.select("Perturbation", &labels, default)?;
                available
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("No perturbation at position {}", idx))?
            }
        };

        if let Err(e) = orch.select_perturbation(&choice).await {
            prompt.retry_or_bail(render::error_line(&e))?;
            continue;
        }
        match orch.apply_selected_perturbation().await {
            Ok(exp) => {
                if let Some(variant) = exp.variant() {
                    if variant.is_valid == Some(false) {
                        println!("  Warning: the service could not parse the variant as an executable");
                    }
                    println!("  Variant ready at {}", variant.download_location);
                }
                return Ok(());
            }
            Err(e) => prompt.retry_or_bail(render::error_line(&e))?,
        }
    }
}

async fn download(
    orch: &ExperimentOrchestrator,
    prompt: &Prompt,
    preset: Option<PathBuf>,
) -> anyhow::Result<()> {
    let target = match preset {
        Some(p) => p,
        None => {
            if !prompt.confirm("Download the variant now?", true)? {
                return Ok(());
            }
            let name = orch
                .snapshot()
                .variant_download_location()
                .map(variant_file_name)
                .unwrap_or_else(|| "variant.bin".to_string());
            prompt.path_with_default("Save variant to", Path::new(&name))?
        }
    };

    loop {
        match orch.download_variant().await {
            Ok(bytes) => {
                tokio::fs::write(&target, &bytes).await?;
                println!("  Saved variant to {} ({} bytes)", target.display(), bytes.len());
                return Ok(());
            }
            // A failed download does not block the experiment.
            Err(e) => {
                if prompt.retry_or_bail(render::error_line(&e)).is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Returns `false` when the user has not tested yet and the run should stop.
async fn acknowledge(orch: &ExperimentOrchestrator, prompt: &Prompt) -> anyhow::Result<bool> {
    println!("  Run both the original and the variant in your sandbox, then note each");
    println!("  report and detection rate.");
    if !prompt.confirm("Have you tested both files in your sandbox?", false)? {
        println!(
            "  Stopping at stage '{}'. Nothing was submitted for analysis.",
            orch.stage()
        );
        return Ok(false);
    }
    orch.acknowledge_sandbox_testing().await?;
    Ok(true)
}

struct AnalysisFlags {
    original_report: Option<PathBuf>,
    variant_report: Option<PathBuf>,
    original_rate: Option<String>,
    variant_rate: Option<String>,
}

async fn analyze(
    orch: &ExperimentOrchestrator,
    prompt: &Prompt,
    mut flags: AnalysisFlags,
) -> anyhow::Result<()> {
    loop {
        let original_path = match flags.original_report.take() {
            Some(p) => p,
            None => prompt.path("Sandbox report for the original", "--original-report")?,
        };
        let variant_path = match flags.variant_report.take() {
            Some(p) => p,
            None => prompt.path("Sandbox report for the variant", "--variant-report")?,
        };
        let original_rate = match flags.original_rate.take() {
            Some(r) => r,
            None => prompt.text("Detection rate of the original (%)", "--original-rate")?,
        };
        let variant_rate = match flags.variant_rate.take() {
            Some(r) => r,
            None => prompt.text("Detection rate of the variant (%)", "--variant-rate")?,
        };

        let inputs = match read_inputs(&original_path, &variant_path, &original_rate, &variant_rate)
            .await
        {
            Ok(inputs) => inputs,
            Err(message) => {
                prompt.retry_or_bail(message)?;
                continue;
            }
        };
        match orch.submit_analysis(inputs).await {
            Ok(_) => return Ok(()),
            Err(e) => prompt.retry_or_bail(render::error_line(&e))?,
        }
    }
}

async fn read_inputs(
    original_path: &Path,
    variant_path: &Path,
    original_rate: &str,
    variant_rate: &str,
) -> Result<AnalysisInputs, String> {
    let original_report = FilePayload::from_path(original_path)
        .await
        .map_err(|e| format!("Cannot read {}: {}", original_path.display(), e))?;
    let variant_report = FilePayload::from_path(variant_path)
        .await
        .map_err(|e| format!("Cannot read {}: {}", variant_path.display(), e))?;
    let original_rate = parse_rate("original", original_rate).map_err(|e| e.to_string())?;
    let variant_rate = parse_rate("variant", variant_rate).map_err(|e| e.to_string())?;
    Ok(AnalysisInputs::new(
        original_report,
        variant_report,
        original_rate,
        variant_rate,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_variant_file_name() {
        assert_eq!(
            variant_file_name("/media/advanced/variants/sample_section_append.bin"),
            "sample_section_append.bin"
        );
        assert_eq!(
            variant_file_name("https://lab.example.org/media/v.exe?sig=abc"),
            "v.exe"
        );
        assert_eq!(variant_file_name("/media/variants/"), "variants");
        assert_eq!(variant_file_name(""), "variant.bin");
    }

    #[test]
    fn test_perturbation_labels_flag_recommendation() {
        let available = vec!["section_append".to_string(), "packer_a".to_string()];
        assert_eq!(
            perturbation_labels(&available, Some("packer_a")),
            vec!["section_append".to_string(), "packer_a (recommended)".to_string()]
        );
        assert_eq!(perturbation_labels(&available, None), available);
    }

    #[tokio::test]
    async fn test_read_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let orig = dir.path().join("orig.xlsx");
        let var = dir.path().join("var.xlsx");
        std::fs::write(&orig, b"orig").unwrap();
        std::fs::write(&var, b"var").unwrap();

        let inputs = read_inputs(&orig, &var, "62", "11.5%").await.unwrap();
        assert_eq!(inputs.original_rate, Some(62.0));
        assert_eq!(inputs.variant_rate, Some(11.5));
        assert_eq!(
            inputs.variant_report.as_ref().map(|r| r.file_name.as_str()),
            Some("var.xlsx")
        );

        let err = read_inputs(&orig, &var, "sixty", "11").await.unwrap_err();
        assert!(err.contains("original detection rate"));

        let missing = dir.path().join("nope.xlsx");
        let err = read_inputs(&missing, &var, "1", "1").await.unwrap_err();
        assert!(err.starts_with("Cannot read"));
    }

    #[test]
    fn test_non_interactive_prompt_uses_defaults() {
        let prompt = Prompt {
            interactive: false,
            assume_yes: false,
        };
        assert!(!prompt.confirm("Tested?", false).unwrap());
        assert_eq!(prompt.select("Pick", &["a".into(), "b".into()], 1).unwrap(), 1);
        assert!(prompt.text("Executable to upload", "--file").is_err());
        assert!(prompt.retry_or_bail("boom".to_string()).is_err());

        let yes = Prompt {
            interactive: false,
            assume_yes: true,
        };
        assert!(yes.confirm("Tested?", false).unwrap());
        assert_eq!(
            yes.path_with_default("Save", Path::new("v.bin")).unwrap(),
            PathBuf::from("v.bin")
        );
    }
}
