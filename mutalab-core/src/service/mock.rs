//! Scripted in-memory transformation service for tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;

use super::TransformationService;
use crate::error::ServiceError;
use crate::types::{AnalysisOutcome, AnalysisRequest, FilePayload, MutateOutcome, StartOutcome};

/// A call observed by the mock, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceCall {
    Start {
        file_name: String,
        size: usize,
    },
    Mutate {
        original_artifact_ref: String,
        perturbation: String,
    },
    Analyze {
        original_artifact_ref: String,
        variant_artifact_ref: String,
        original_rate: f64,
        variant_rate: f64,
    },
    Download {
        location: String,
    },
}

type Queue<T> = Mutex<VecDeque<Result<T, ServiceError>>>;

/// Returns queued responses in order and records every call.
///
/// With [`hold_calls`](Self::hold_calls) active, each call parks after being
/// recorded until [`release_one`](Self::release_one) lets it finish, which keeps
/// a request "in flight" for as long as a test needs.
#[derive(Default)]
pub struct MockTransformationService {
    start: Queue<StartOutcome>,
    mutate: Queue<MutateOutcome>,
    analyze: Queue<AnalysisOutcome>,
    download: Queue<Bytes>,
    calls: Mutex<Vec<ServiceCall>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn pop<T>(queue: &Queue<T>, op: &str) -> Result<T, ServiceError> {
    lock(queue)
        .pop_front()
        .unwrap_or_else(|| {
            Err(ServiceError::Connection {
                message: format!("mock: no {op} response queued"),
            })
        })
}

impl MockTransformationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_start(&self, result: Result<StartOutcome, ServiceError>) -> &Self {
        lock(&self.start).push_back(result);
        self
    }

    pub fn queue_mutate(&self, result: Result<MutateOutcome, ServiceError>) -> &Self {
        lock(&self.mutate).push_back(result);
        self
    }

    pub fn queue_analyze(&self, result: Result<AnalysisOutcome, ServiceError>) -> &Self {
        lock(&self.analyze).push_back(result);
        self
    }

    pub fn queue_download(&self, result: Result<Bytes, ServiceError>) -> &Self {
        lock(&self.download).push_back(result);
        self
    }

    /// Park every subsequent call until released.
    pub fn hold_calls(&self) {
        *lock(&self.gate) = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let one parked (or future) call complete.
    pub fn release_one(&self) {
        if let Some(gate) = lock(&self.gate).as_ref() {
            gate.add_permits(1);
        }
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Yield until at least `count` calls have been recorded.
    pub async fn wait_for_calls(&self, count: usize) {
        while self.call_count() < count {
            tokio::task::yield_now().await;
        }
    }

    async fn enter(&self, call: ServiceCall) {
        lock(&self.calls).push(call);
        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
    }
}

#[async_trait]
impl TransformationService for MockTransformationService {
    async fn start(&self, file: FilePayload) -> Result<StartOutcome, ServiceError> {
        self.enter(ServiceCall::Start {
            file_name: file.file_name.clone(),
            size: file.len(),
        })
        .await;
        pop(&self.start, "start")
    }

    async fn mutate(
        &self,
        original_artifact_ref: &str,
        perturbation: &str,
    ) -> Result<MutateOutcome, ServiceError> {
        self.enter(ServiceCall::Mutate {
            original_artifact_ref: original_artifact_ref.to_string(),
            perturbation: perturbation.to_string(),
        })
        .await;
        pop(&self.mutate, "mutate")
    }

    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisOutcome, ServiceError> {
        self.enter(ServiceCall::Analyze {
            original_artifact_ref: request.original_artifact_ref.clone(),
            variant_artifact_ref: request.variant_artifact_ref.clone(),
            original_rate: request.measurements.original.detection_rate,
            variant_rate: request.measurements.variant.detection_rate,
        })
        .await;
        pop(&self.analyze, "analyze")
    }

    async fn download(&self, location: &str) -> Result<Bytes, ServiceError> {
        self.enter(ServiceCall::Download {
            location: location.to_string(),
        })
        .await;
        pop(&self.download, "download")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_returns_queued_in_order() {
        let mock = MockTransformationService::new();
        mock.queue_download(Ok(Bytes::from_static(b"one")))
            .queue_download(Ok(Bytes::from_static(b"two")));
        assert_eq!(mock.download("/a").await.unwrap(), "one");
        assert_eq!(mock.download("/b").await.unwrap(), "two");
        assert!(mock.download("/c").await.is_err());
        assert_eq!(mock.call_count(), 3);
        assert_eq!(
            mock.calls()[0],
            ServiceCall::Download {
                location: "/a".into()
            }
        );
    }

    #[tokio::test]
    async fn test_mock_gate_holds_until_released() {
        let mock = Arc::new(MockTransformationService::new());
        mock.queue_download(Ok(Bytes::from_static(b"v")));
        mock.hold_calls();

        let m = mock.clone();
        let handle = tokio::spawn(async move { m.download("/v").await });
        mock.wait_for_calls(1).await;
        assert!(!handle.is_finished());

        mock.release_one();
        assert_eq!(handle.await.unwrap().unwrap(), "v");
    }
}
