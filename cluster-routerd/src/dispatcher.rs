//! Cluster dispatcher: resolve a model service, pick an instance, forward
//! the inference request and classify the outcome.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use reqwest::multipart::{Form, Part};
use shared::protocol::{FILE_PART, INFERENCE_PATH};
use shared::types::ModelServiceKey;
use tokio_util::io::ReaderStream;
use crate::config::DispatchConfig;
use crate::error::{error_chain, DispatchError};
use crate::registry::{InstanceFilter, ServiceRegistry};
use crate::selector::InstanceSelector;

/// Upstream JSON body, passed through untouched
pub type InferenceResult = serde_json::Value;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Where the input file comes from
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Bytes {
        file_name: String,
        content_type: Option<String>,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    source: FileSource,
    parameters: HashMap<String, String>,
}

impl InferenceRequest {
    /// Build a request from optional sources; exactly one must be given.
    pub fn new(
        path: Option<PathBuf>,
        bytes: Option<(String, Vec<u8>)>,
        parameters: HashMap<String, String>,
    ) -> Result<Self, DispatchError> {
        let source = match (path, bytes) {
            (Some(path), None) => FileSource::Path(path),
            (None, Some((file_name, data))) => FileSource::Bytes {
                file_name,
                content_type: None,
                data,
            },
            (None, None) => {
                return Err(DispatchError::InvalidRequest("no input file provided".to_string()))
            }
            (Some(_), Some(_)) => {
                return Err(DispatchError::InvalidRequest(
                    "both a file path and file bytes were provided".to_string(),
                ))
            }
        };
        Ok(Self { source, parameters })
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: FileSource::Path(path.into()),
            parameters: HashMap::new(),
        }
    }

    pub fn from_bytes(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            source: FileSource::Bytes {
                file_name: file_name.into(),
                content_type: None,
                data,
            },
            parameters: HashMap::new(),
        }
    }

    /// Content type of the file part; only meaningful for in-memory input.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        if let FileSource::Bytes { content_type: ct, .. } = &mut self.source {
            *ct = Some(content_type.into());
        }
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn source(&self) -> &FileSource {
        &self.source
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    /// Open the byte source and turn it into the multipart file part.
    /// Runs before any network call.
    async fn into_form(self) -> Result<Form, DispatchError> {
        let part = match self.source {
            FileSource::Path(path) => {
                let file = tokio::fs::File::open(&path).await.map_err(|e| {
                    DispatchError::InvalidRequest(format!("cannot open {}: {}", path.display(), e))
                })?;
                let metadata = file.metadata().await.map_err(|e| {
                    DispatchError::InvalidRequest(format!("cannot stat {}: {}", path.display(), e))
                })?;
                if !metadata.is_file() {
                    return Err(DispatchError::InvalidRequest(format!(
                        "{} is not a regular file",
                        path.display()
                    )));
                }

                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "upload".to_string());
                let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

                Part::stream_with_length(body, metadata.len())
                    .file_name(file_name)
                    .mime_str(DEFAULT_CONTENT_TYPE)
            }
            FileSource::Bytes { file_name, content_type, data } => Part::bytes(data)
                .file_name(file_name)
                .mime_str(content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)),
        }
        .map_err(|e| DispatchError::InvalidRequest(format!("invalid content type: {}", e)))?;

        let form = self
            .parameters
            .into_iter()
            .fold(Form::new().part(FILE_PART, part), |form, (key, value)| form.text(key, value));

        Ok(form)
    }
}

pub struct ClusterDispatcher {
    registry: Arc<dyn ServiceRegistry>,
    selector: Arc<dyn InstanceSelector>,
    client: reqwest::Client,
    timeout: Duration,
}

impl ClusterDispatcher {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        selector: Arc<dyn InstanceSelector>,
        config: &DispatchConfig,
    ) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(timeout)
            .build()
            .context("Failed to create inference HTTP client")?;

        Ok(Self {
            registry,
            selector,
            client,
            timeout,
        })
    }

    pub fn registry(&self) -> &Arc<dyn ServiceRegistry> {
        &self.registry
    }

    /// Route one inference request to a live instance of `key`.
    ///
    /// Makes one registry lookup and at most one instance call; never retries
    /// and never reuses a previous resolution.
    pub async fn dispatch(
        &self,
        key: &ModelServiceKey,
        request: InferenceRequest,
    ) -> Result<InferenceResult, DispatchError> {
        let service = key.service_name();

        let form = request.into_form().await?;

        let instances = self
            .registry
            .resolve_instances(&service, InstanceFilter::HealthyOnly)
            .await
            .map_err(|source| DispatchError::ServiceUnavailable {
                service: service.clone(),
                source,
            })?;

        if instances.is_empty() {
            return Err(DispatchError::NoInstanceFound(service));
        }

        let instance = self
            .selector
            .select(&instances)
            .ok_or_else(|| DispatchError::NoInstanceFound(service.clone()))?;

        let endpoint = format!("{}{}", instance.base_url(), INFERENCE_PATH);
        tracing::info!(
            service = %service,
            endpoint = %endpoint,
            candidates = instances.len(),
            "Dispatching inference"
        );

        let resp = self
            .client
            .post(&endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| DispatchError::Upstream {
                endpoint: endpoint.clone(),
                status: None,
                detail: self.describe_transport_error(&e),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(endpoint = %endpoint, status = status.as_u16(), "Inference instance returned an error");
            return Err(DispatchError::Upstream {
                endpoint,
                status: Some(status.as_u16()),
                detail: body,
            });
        }

        resp.json::<InferenceResult>().await.map_err(|e| DispatchError::Upstream {
            endpoint: endpoint.clone(),
            status: Some(status.as_u16()),
            detail: format!("invalid JSON body: {}", e),
        })
    }

    fn describe_transport_error(&self, e: &reqwest::Error) -> String {
        if e.is_timeout() {
            return format!("timed out after {}s", self.timeout.as_secs());
        }

        error_chain(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use serde_json::json;
    use shared::types::{ModelFormat, ServiceInstance};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use crate::selector::{RandomSelector, RoundRobinSelector};
    use crate::testing::FixedRegistry;

    fn instance_for(server: &MockServer) -> ServiceInstance {
        let addr = server.address();
        ServiceInstance::new(addr.ip().to_string(), addr.port())
    }

    fn dispatcher(registry: Arc<FixedRegistry>, timeout_secs: u64) -> ClusterDispatcher {
        let config = DispatchConfig {
            timeout_secs,
            connect_timeout_secs: 1,
            ..DispatchConfig::default()
        };
        ClusterDispatcher::new(registry, Arc::new(RandomSelector), &config).unwrap()
    }

    fn key() -> ModelServiceKey {
        ModelServiceKey::new(1, ModelFormat::Onnx, "v1")
    }

    #[tokio::test]
    async fn test_dispatch_returns_body_verbatim() {
        let body = json!({"result": {"detections": [{"class": "person", "conf": 0.91}]}});

        let first = MockServer::start().await;
        let second = MockServer::start().await;
        for server in [&first, &second] {
            Mock::given(method("POST"))
                .and(path(INFERENCE_PATH))
                .respond_with(ResponseTemplate::new(200).set_body_json(body.clone()))
                .mount(server)
                .await;
        }

        let registry = FixedRegistry::with(vec![instance_for(&first), instance_for(&second)]);
        let dispatcher = dispatcher(registry.clone(), 5);

        let request = InferenceRequest::from_bytes("frame.jpg", b"jpeg-bytes".to_vec())
            .with_content_type("image/jpeg");
        let result = dispatcher.dispatch(&key(), request).await.unwrap();

        assert_eq!(result, body);
        assert_eq!(registry.calls(), 1);
        assert_eq!(registry.last_service().as_deref(), Some("model_1_onnx_v1"));

        let served = first.received_requests().await.unwrap().len()
            + second.received_requests().await.unwrap().len();
        assert_eq!(served, 1, "Exactly one instance should be called");
    }

    #[tokio::test]
    async fn test_every_dispatch_resolves_again() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INFERENCE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": []})))
            .mount(&server)
            .await;

        let registry = FixedRegistry::with(vec![instance_for(&server)]);
        let dispatcher = dispatcher(registry.clone(), 5);

        for _ in 0..3 {
            let request = InferenceRequest::from_bytes("a.jpg", vec![1, 2, 3]);
            dispatcher.dispatch(&key(), request).await.unwrap();
        }

        assert_eq!(registry.calls(), 3);
    }

    #[tokio::test]
    async fn test_parameters_and_file_sent_as_multipart() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INFERENCE_PATH))
            .and(body_string_contains("name=\"file\"; filename=\"frame.jpg\""))
            .and(body_string_contains("name=\"conf_thres\""))
            .and(body_string_contains("0.45"))
            .and(body_string_contains("frame-payload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let registry = FixedRegistry::with(vec![instance_for(&server)]);
        let request = InferenceRequest::from_bytes("frame.jpg", b"frame-payload".to_vec())
            .with_parameter("conf_thres", "0.45");

        let result = dispatcher(registry, 5).dispatch(&key(), request).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_file_path_is_streamed() {
        let mut file = tempfile::Builder::new().suffix(".jpg").tempfile().unwrap();
        file.write_all(b"on-disk-frame").unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INFERENCE_PATH))
            .and(body_string_contains("on-disk-frame"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        let registry = FixedRegistry::with(vec![instance_for(&server)]);
        let request = InferenceRequest::from_path(file.path());

        let result = dispatcher(registry, 5).dispatch(&key(), request).await.unwrap();
        assert_eq!(result, json!({"result": "ok"}));
    }

    #[tokio::test]
    async fn test_unreadable_file_makes_no_network_calls() {
        let registry = FixedRegistry::with(vec![ServiceInstance::new("10.0.0.1", 8000)]);
        let request = InferenceRequest::from_path("/nonexistent/frame.jpg");

        let err = dispatcher(registry.clone(), 5).dispatch(&key(), request).await.unwrap_err();

        assert!(matches!(err, DispatchError::InvalidRequest(_)));
        assert_eq!(registry.calls(), 0);
    }

    #[tokio::test]
    async fn test_directory_is_not_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FixedRegistry::with(vec![ServiceInstance::new("10.0.0.1", 8000)]);

        let err = dispatcher(registry.clone(), 5)
            .dispatch(&key(), InferenceRequest::from_path(dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::InvalidRequest(_)));
        assert_eq!(registry.calls(), 0);
    }

    #[test]
    fn test_request_needs_exactly_one_source() {
        let none = InferenceRequest::new(None, None, HashMap::new());
        assert!(matches!(none, Err(DispatchError::InvalidRequest(_))));

        let both = InferenceRequest::new(
            Some(PathBuf::from("/tmp/a.jpg")),
            Some(("a.jpg".to_string(), vec![1])),
            HashMap::new(),
        );
        assert!(matches!(both, Err(DispatchError::InvalidRequest(_))));

        let one = InferenceRequest::new(Some(PathBuf::from("/tmp/a.jpg")), None, HashMap::new()).unwrap();
        assert!(matches!(one.source(), FileSource::Path(_)));
    }

    #[tokio::test]
    async fn test_no_instances_is_no_instance_found() {
        let registry = FixedRegistry::with(Vec::new());
        let err = dispatcher(registry.clone(), 5)
            .dispatch(&key(), InferenceRequest::from_bytes("a.jpg", vec![1]))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::NoInstanceFound(ref s) if s == "model_1_onnx_v1"));
        assert_eq!(registry.calls(), 1);
    }

    #[tokio::test]
    async fn test_registry_down_is_service_unavailable() {
        let err = dispatcher(FixedRegistry::down(), 5)
            .dispatch(&key(), InferenceRequest::from_bytes("a.jpg", vec![1]))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_upstream_error_status_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INFERENCE_PATH))
            .respond_with(ResponseTemplate::new(503).set_body_string("model loading"))
            .mount(&server)
            .await;

        let registry = FixedRegistry::with(vec![instance_for(&server)]);
        let err = dispatcher(registry, 5)
            .dispatch(&key(), InferenceRequest::from_bytes("a.jpg", vec![1]))
            .await
            .unwrap_err();

        match err {
            DispatchError::Upstream { endpoint, status, detail } => {
                assert!(endpoint.ends_with("/inference"));
                assert_eq!(status, Some(503));
                assert_eq!(detail, "model loading");
            }
            other => panic!("expected upstream error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_json_body_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INFERENCE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let registry = FixedRegistry::with(vec![instance_for(&server)]);
        let err = dispatcher(registry, 5)
            .dispatch(&key(), InferenceRequest::from_bytes("a.jpg", vec![1]))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Upstream { status: Some(200), .. }));
    }

    #[tokio::test]
    async fn test_unreachable_instance_is_upstream_error() {
        let registry = FixedRegistry::with(vec![ServiceInstance::new("127.0.0.1", 1)]);
        let err = dispatcher(registry, 5)
            .dispatch(&key(), InferenceRequest::from_bytes("a.jpg", vec![1]))
            .await
            .unwrap_err();

        match err {
            DispatchError::Upstream { endpoint, status, .. } => {
                assert_eq!(endpoint, "http://127.0.0.1:1/inference");
                assert_eq!(status, None);
            }
            other => panic!("expected upstream error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_instance_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INFERENCE_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"result": "late"}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let registry = FixedRegistry::with(vec![instance_for(&server)]);
        let err = dispatcher(registry, 1)
            .dispatch(&key(), InferenceRequest::from_bytes("a.jpg", vec![1]))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Upstream { status: None, ref detail, .. } if detail.contains("timed out")));
    }

    #[tokio::test]
    async fn test_round_robin_spreads_over_instances() {
        let first = MockServer::start().await;
        let second = MockServer::start().await;
        for server in [&first, &second] {
            Mock::given(method("POST"))
                .and(path(INFERENCE_PATH))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": []})))
                .mount(server)
                .await;
        }

        let registry = FixedRegistry::with(vec![instance_for(&first), instance_for(&second)]);
        let dispatcher = ClusterDispatcher::new(
            registry,
            Arc::new(RoundRobinSelector::default()),
            &DispatchConfig::default(),
        )
        .unwrap();

        for _ in 0..4 {
            dispatcher
                .dispatch(&key(), InferenceRequest::from_bytes("a.jpg", vec![1]))
                .await
                .unwrap();
        }

        assert_eq!(first.received_requests().await.unwrap().len(), 2);
        assert_eq!(second.received_requests().await.unwrap().len(), 2);
    }
}
