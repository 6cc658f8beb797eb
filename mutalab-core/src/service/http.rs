//! HTTP client for the transformation service.
//!
//! Binary payloads travel as multipart form data, the mutate call as JSON. Every
//! request carries an `Authorization: <scheme> <token>` header whose token comes
//! from the injected [`TokenProvider`].

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{TransformationService, with_retry, with_retry_if};
use crate::config::{MutalabConfig, RetryConfig, ServiceConfig};
use crate::credentials::TokenProvider;
use crate::error::ServiceError;
use crate::types::{
    AnalysisDetails, AnalysisOutcome, AnalysisRequest, FilePayload, FinalReport, MutateOutcome,
    StartOutcome,
};

pub const START_PATH: &str = "/api/advanced/start/";
pub const MUTATE_PATH: &str = "/api/advanced/mutate/";
pub const ANALYZE_PATH: &str = "/api/advanced/analyze/";

/// Longest slice of an error body quoted back to the user.
const MAX_ERROR_BODY: usize = 300;

/// Uploads and mutations are not idempotent; only a request the service
/// refused outright is sent again.
const POST_RETRYABLE: fn(&ServiceError) -> bool = ServiceError::is_rejected_unprocessed;

#[derive(Debug, Deserialize)]
struct StartResponse {
    original_file_path: String,
    #[serde(default)]
    available_perturbations: Vec<String>,
    recommendation: String,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

impl From<StartResponse> for StartOutcome {
    fn from(r: StartResponse) -> Self {
        StartOutcome {
            original_artifact_ref: r.original_file_path,
            available_perturbations: r.available_perturbations,
            recommended_perturbation: r.recommendation,
            md5: r.md5,
            size_bytes: r.size,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MutateResponse {
    variant_url: String,
    variant_path: String,
    #[serde(default)]
    variant_md5: Option<String>,
    #[serde(default)]
    variant_size: Option<u64>,
    #[serde(default)]
    is_valid: Option<bool>,
}

impl From<MutateResponse> for MutateOutcome {
    fn from(r: MutateResponse) -> Self {
        MutateOutcome {
            variant_artifact_ref: r.variant_path,
            variant_download_location: r.variant_url,
            variant_md5: r.variant_md5,
            variant_size_bytes: r.variant_size,
            is_valid: r.is_valid,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Scores {
    /// The service sends `null` when it could not compute a fitness.
    #[serde(default)]
    fitness: Option<f64>,
    vt_reduction_percent: f64,
    ssdeep_distance: f64,
    is_functional: bool,
    #[serde(default)]
    vt_original: Option<f64>,
    #[serde(default)]
    vt_variant: Option<f64>,
    #[serde(default)]
    vt_reduction: Option<f64>,
    #[serde(default)]
    weight_vt: Option<f64>,
    #[serde(default)]
    weight_ssdeep: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    scores: Scores,
    similarity_percent: f64,
    #[serde(default)]
    signatures_original: Vec<String>,
    #[serde(default)]
    signatures_variant: Vec<String>,
}

impl From<AnalyzeResponse> for AnalysisOutcome {
    fn from(r: AnalyzeResponse) -> Self {
        AnalysisOutcome {
            report: FinalReport {
                fitness: r.scores.fitness.unwrap_or(0.0),
                vt_reduction_percent: r.scores.vt_reduction_percent,
                ssdeep_distance: r.scores.ssdeep_distance,
                is_functional: r.scores.is_functional,
                behavioral_overlap_percent: r.similarity_percent,
            },
            details: AnalysisDetails {
                vt_original: r.scores.vt_original,
                vt_variant: r.scores.vt_variant,
                vt_reduction: r.scores.vt_reduction,
                weight_vt: r.scores.weight_vt,
                weight_ssdeep: r.scores.weight_ssdeep,
                signatures_original: r.signatures_original,
                signatures_variant: r.signatures_variant,
            },
        }
    }
}

/// Resolve a download location against the service base URL.
///
/// Absolute URLs are returned unchanged; paths such as `/media/advanced/variants/x.exe`
/// are appended to the base.
pub fn resolve_download_url(base_url: &str, location: &str) -> Result<Url, ServiceError> {
    if let Ok(absolute) = Url::parse(location) {
        return Ok(absolute);
    }
    let joined = if location.starts_with('/') {
        format!("{}{}", base_url.trim_end_matches('/'), location)
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), location)
    };
    Url::parse(&joined).map_err(|e| ServiceError::InvalidUrl {
        message: format!("{}: {}", joined, e),
    })
}

/// Pull a human-readable message out of an error body.
///
/// The service reports failures as `{"error": "..."}`; authentication failures
/// use `{"detail": "..."}`. Anything else is quoted, truncated.
fn extract_error_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        for key in ["error", "detail", "message"] {
            if let Some(msg) = json.get(key).and_then(Value::as_str) {
                return msg.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.chars().count() > MAX_ERROR_BODY {
        let cut: String = trimmed.chars().take(MAX_ERROR_BODY).collect();
        format!("{cut}...")
    } else {
        trimmed.to_string()
    }
}

/// Transformation service reached over HTTP.
pub struct HttpTransformationService {
    client: Client,
    base_url: String,
    auth_scheme: String,
    timeout_secs: u64,
    retry: RetryConfig,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for HttpTransformationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransformationService")
            .field("base_url", &self.base_url)
            .field("auth_scheme", &self.auth_scheme)
            .finish_non_exhaustive()
    }
}

impl HttpTransformationService {
    pub fn new(
        service: &ServiceConfig,
        retry: RetryConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, ServiceError> {
        Url::parse(&service.base_url).map_err(|e| ServiceError::InvalidUrl {
            message: format!("{}: {}", service.base_url, e),
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(service.timeout_secs))
            .connect_timeout(Duration::from_secs(service.connect_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Connection {
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: service.base_url.trim_end_matches('/').to_string(),
            auth_scheme: service.auth_scheme.clone(),
            timeout_secs: service.timeout_secs,
            retry,
            tokens,
        })
    }

    /// Build a client from a loaded configuration.
    pub fn from_config(
        config: &MutalabConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, ServiceError> {
        Self::new(&config.service, config.retry.clone(), tokens)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn file_part(payload: &FilePayload) -> Part {
        Part::bytes(payload.content.to_vec()).file_name(payload.file_name.clone())
    }

    fn start_form(file: &FilePayload) -> Form {
        Form::new().part("file", Self::file_part(file))
    }

    fn analyze_form(request: &AnalysisRequest) -> Form {
        let m = &request.measurements;
        Form::new()
            .part("excel_original", Self::file_part(&m.original.report))
            .part("excel_variant", Self::file_part(&m.variant.report))
            .text("rate_original", m.original.detection_rate.to_string())
            .text("rate_variant", m.variant.detection_rate.to_string())
            .text("original_file_path", request.original_artifact_ref.clone())
            .text("variant_file_path", request.variant_artifact_ref.clone())
    }

    /// Map an HTTP status code to the appropriate `ServiceError`.
    fn map_http_error(status: StatusCode, retry_after: Option<u64>, body: &str) -> ServiceError {
        match status.as_u16() {
            401 | 403 => {
                debug!(body = %body, status = status.as_u16(), "Authentication rejected");
                ServiceError::AuthFailed
            }
            429 => ServiceError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(5),
            },
            code => ServiceError::Http {
                status: code,
                message: extract_error_message(body),
            },
        }
    }

    fn map_transport_error(&self, err: reqwest::Error) -> ServiceError {
        if err.is_timeout() {
            ServiceError::Timeout {
                timeout_secs: self.timeout_secs,
            }
        } else {
            ServiceError::Connection {
                message: format!("Request failed: {}", err),
            }
        }
    }

    /// Attach auth, send, and turn non-2xx responses into errors.
    async fn dispatch(&self, request: RequestBuilder) -> Result<Response, ServiceError> {
        let token = self.tokens.token()?;
        let response = request
            .header(
                header::AUTHORIZATION,
                format!("{} {}", self.auth_scheme, token),
            )
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        Err(Self::map_http_error(status, retry_after, &body))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ServiceError> {
        let response = self.dispatch(request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::Connection {
                message: format!("Failed to read response body: {}", e),
            })?;
        serde_json::from_str(&body).map_err(|e| ServiceError::ResponseParse {
            message: format!("Invalid JSON: {}", e),
        })
    }
}

#[async_trait]
impl TransformationService for HttpTransformationService {
    async fn start(&self, file: FilePayload) -> Result<StartOutcome, ServiceError> {
        let url = self.endpoint(START_PATH);
        debug!(url = %url, file = %file.file_name, size = file.len(), "Uploading original");
        let (url, file) = (&url, &file);
        let response: StartResponse = with_retry_if(&self.retry, POST_RETRYABLE, || async move {
            let request = self.client.post(url).multipart(Self::start_form(file));
            self.send_json(request).await
        })
        .await?;
        Ok(response.into())
    }

    async fn mutate(
        &self,
        original_artifact_ref: &str,
        perturbation: &str,
    ) -> Result<MutateOutcome, ServiceError> {
        let url = self.endpoint(MUTATE_PATH);
        debug!(url = %url, perturbation = %perturbation, "Requesting mutation");
        let body = json!({
            "original_path": original_artifact_ref,
            "perturbation": perturbation,
        });
        let (url, body) = (&url, &body);
        let response: MutateResponse = with_retry_if(&self.retry, POST_RETRYABLE, || async move {
            let request = self.client.post(url).json(body);
            self.send_json(request).await
        })
        .await?;
        Ok(response.into())
    }

    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisOutcome, ServiceError> {
        let url = self.endpoint(ANALYZE_PATH);
        debug!(
            url = %url,
            rate_original = request.measurements.original.detection_rate,
            rate_variant = request.measurements.variant.detection_rate,
            "Submitting analysis"
        );
        let (url, request) = (&url, &request);
        let response: AnalyzeResponse = with_retry_if(&self.retry, POST_RETRYABLE, || async move {
            let req = self.client.post(url).multipart(Self::analyze_form(request));
            self.send_json(req).await
        })
        .await?;
        Ok(response.into())
    }

    async fn download(&self, location: &str) -> Result<Bytes, ServiceError> {
        let url = resolve_download_url(&self.base_url, location)?;
        debug!(url = %url, "Downloading variant");
        let url = &url;
        with_retry(&self.retry, || async move {
            let response = self.dispatch(self.client.get(url.clone())).await?;
            response
                .bytes()
                .await
                .map_err(|e| ServiceError::Connection {
                    message: format!("Failed to read download body: {}", e),
                })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticToken;

    fn test_service(base_url: &str) -> HttpTransformationService {
        let config = ServiceConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        };
        HttpTransformationService::new(
            &config,
            RetryConfig::default(),
            Arc::new(StaticToken::new("t")),
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_base_url() {
        let config = ServiceConfig {
            base_url: "::nope::".to_string(),
            ..Default::default()
        };
        let err = HttpTransformationService::new(
            &config,
            RetryConfig::default(),
            Arc::new(StaticToken::new("t")),
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidUrl { .. }));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let service = test_service("http://localhost:8000/");
        assert_eq!(
            service.endpoint(START_PATH),
            "http://localhost:8000/api/advanced/start/"
        );
    }

    #[test]
    fn test_resolve_download_url_relative() {
        let url = resolve_download_url(
            "http://localhost:8000",
            "/media/advanced/variants/a.exe.section_append.exe",
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8000/media/advanced/variants/a.exe.section_append.exe"
        );
        let url = resolve_download_url("http://lab.local/", "files/var-1").unwrap();
        assert_eq!(url.as_str(), "http://lab.local/files/var-1");
    }

    #[test]
    fn test_resolve_download_url_absolute_passthrough() {
        let url = resolve_download_url("http://localhost:8000", "https://cdn.example.org/v.exe")
            .unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.org/v.exe");
    }

    #[test]
    fn test_extract_error_message_variants() {
        assert_eq!(
            extract_error_message(r#"{"error": "Original file not found"}"#),
            "Original file not found"
        );
        assert_eq!(
            extract_error_message(r#"{"detail": "Invalid token."}"#),
            "Invalid token."
        );
        assert_eq!(extract_error_message("  Bad Gateway \n"), "Bad Gateway");
        let long = "x".repeat(1000);
        assert!(extract_error_message(&long).ends_with("..."));
    }

    #[test]
    fn test_http_error_mapping() {
        assert!(matches!(
            HttpTransformationService::map_http_error(StatusCode::UNAUTHORIZED, None, ""),
            ServiceError::AuthFailed
        ));
        assert!(matches!(
            HttpTransformationService::map_http_error(StatusCode::TOO_MANY_REQUESTS, Some(12), ""),
            ServiceError::RateLimited {
                retry_after_secs: 12
            }
        ));
        match HttpTransformationService::map_http_error(
            StatusCode::BAD_REQUEST,
            None,
            r#"{"error": "Both Excel reports are required"}"#,
        ) {
            ServiceError::Http { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Both Excel reports are required");
            }
            other => panic!("Expected Http, got {:?}", other),
        }
    }

    #[test]
    fn test_start_response_conversion() {
        let body = r#"{
            "status": "success",
            "message": "File prepared.",
            "original_file_path": "/srv/media/advanced/original/sample.exe",
            "md5": "abc",
            "size": 2048,
            "recommendation": "section_append",
            "available_perturbations": ["section_append", "generic_append"]
        }"#;
        let outcome: StartOutcome = serde_json::from_str::<StartResponse>(body).unwrap().into();
        assert_eq!(
            outcome.original_artifact_ref,
            "/srv/media/advanced/original/sample.exe"
        );
        assert_eq!(outcome.recommended_perturbation, "section_append");
        assert_eq!(outcome.available_perturbations.len(), 2);
        assert_eq!(outcome.size_bytes, Some(2048));
    }

    #[test]
    fn test_analyze_response_conversion_with_null_fitness() {
        let body = r#"{
            "status": "success",
            "scores": {
                "fitness": null,
                "is_functional": false,
                "vt_original": 0.62,
                "vt_variant": 0.11,
                "vt_reduction": 0.51,
                "vt_reduction_percent": 82.3,
                "ssdeep_distance": 74,
                "weight_vt": 0.7,
                "weight_ssdeep": 0.3
            },
            "similarity_percent": 40.0,
            "signatures_original": ["CreateFileW"],
            "signatures_variant": []
        }"#;
        let outcome: AnalysisOutcome = serde_json::from_str::<AnalyzeResponse>(body)
            .unwrap()
            .into();
        assert_eq!(outcome.report.fitness, 0.0);
        assert_eq!(outcome.report.ssdeep_distance, 74.0);
        assert!(!outcome.report.is_functional);
        assert_eq!(outcome.report.behavioral_overlap_percent, 40.0);
        assert_eq!(outcome.details.weight_vt, Some(0.7));
        assert_eq!(outcome.details.signatures_original, vec!["CreateFileW"]);
    }
}
