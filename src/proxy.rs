use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::header::{AUTHORIZATION, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, Response};
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::AppError;
use crate::interceptor::{OnCompletion, StreamInterceptor};
use crate::metrics::Metrics;
use crate::registry::ProviderRegistry;
use crate::router::{ModelRouter, RequestProbe};

/// Largest accepted request body. Larger payloads get `413`.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Routing facts for one provider attempt, handed to the response hook.
#[derive(Clone, Debug)]
pub struct AttemptInfo {
    pub method: String,
    pub path: String,
    pub original_model: String,
    pub provider: String,
    pub translated_model: String,
}

/// Inspects a dispatched upstream response and may return a completion
/// callback; when it does, the response body is wrapped in a
/// [`StreamInterceptor`] carrying that callback.
pub type ResponseHook =
    Arc<dyn Fn(&AttemptInfo, &reqwest::Response) -> Option<OnCompletion> + Send + Sync>;

pub struct ProxyCore {
    registry: Arc<ProviderRegistry>,
    router: ModelRouter,
    response_hook: Option<ResponseHook>,
    metrics: Metrics,
}

impl ProxyCore {
    pub fn new(registry: Arc<ProviderRegistry>, router: ModelRouter, metrics: Metrics) -> Self {
        Self {
            registry,
            router,
            response_hook: None,
            metrics,
        }
    }

    pub fn with_response_hook(mut self, hook: ResponseHook) -> Self {
        self.response_hook = Some(hook);
        self
    }

    /// Proxies one request: drain the body once, pick the provider chain,
    /// then attempt providers in order until one dispatches.
    pub async fn serve(&self, request: Request) -> Result<Response<Body>, AppError> {
        let (parts, body) = request.into_parts();
        let body = read_body(body, &parts.headers).await?;

        let strategy = self.router.select_strategy(&body)?;
        let original_model = serde_json::from_slice::<RequestProbe>(&body)
            .ok()
            .and_then(|probe| probe.model)
            .unwrap_or_default();

        let method = parts.method;
        let path = parts.uri.path().to_string();

        for provider_name in &strategy.providers {
            let Some(provider) = self.registry.config(provider_name) else {
                warn!(provider = %provider_name, "provider not found or not enabled");
                continue;
            };
            let Some(client) = self.registry.client(provider_name) else {
                warn!(provider = %provider_name, "no client for provider");
                continue;
            };

            let (modified_body, translated_model) = rewrite_model(&body, provider_name)?;
            let url = format!("{}{}", provider.target_url.trim_end_matches('/'), path);

            let mut headers = parts.headers.clone();
            strip_request_headers(&mut headers);

            info!(
                original_model = %original_model,
                provider = %provider_name,
                translated_model = %translated_model,
                method = %method,
                path = %path,
                "routing request"
            );

            let outbound = client
                .request(method.clone(), &url)
                .headers(headers)
                .header(AUTHORIZATION, format!("Bearer {}", provider.api_key))
                .body(modified_body);

            let response = match outbound.send().await {
                Ok(response) => response,
                Err(err) => {
                    // Transport-level failure before any status byte: the
                    // next provider in the chain gets a chance.
                    warn!(
                        provider = %provider_name,
                        error = %err,
                        "dispatch failed; trying next provider"
                    );
                    self.metrics
                        .errors
                        .add(1, &[KeyValue::new("type", "dispatch_error")]);
                    continue;
                }
            };

            let attempt = AttemptInfo {
                method: method.to_string(),
                path,
                original_model,
                provider: provider_name.clone(),
                translated_model,
            };
            return self.forward_response(attempt, response);
        }

        Err(AppError::no_upstream(
            "All providers in the fallback chain failed",
        ))
    }

    /// Streams a dispatched upstream response back to the client. Chunks
    /// are forwarded as they arrive; nothing is buffered end-to-end.
    fn forward_response(
        &self,
        attempt: AttemptInfo,
        response: reqwest::Response,
    ) -> Result<Response<Body>, AppError> {
        let status = response.status();
        let mut builder = Response::builder().status(status);
        for (name, value) in response.headers() {
            if is_hop_header(name) {
                continue;
            }
            builder = builder.header(name, value);
        }

        let on_completion = self
            .response_hook
            .as_ref()
            .and_then(|hook| hook(&attempt, &response));

        let stream = Box::pin(response.bytes_stream());
        let body = match on_completion {
            Some(callback) => Body::from_stream(StreamInterceptor::new(stream, callback)),
            None => Body::from_stream(stream),
        };

        builder
            .body(body)
            .map_err(|e| AppError::internal(format!("response build error: {}", e)))
    }
}

/// Drains the request body into owned bytes, bounded by [`MAX_BODY_BYTES`].
/// Every later consumer works from this buffer; the wire is read once.
pub async fn read_body(body: Body, headers: &HeaderMap) -> Result<Bytes, AppError> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|length| length > MAX_BODY_BYTES) {
        return Err(AppError::payload_too_large("request body too large"));
    }

    axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|err| {
            if is_length_limit(&err) {
                AppError::payload_too_large("request body too large")
            } else {
                AppError::invalid_request(format!("failed to read request body: {}", err))
            }
        })
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if current.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        source = current.source();
    }
    false
}

/// Strips the `<provider>/` namespace off the `model` field so the
/// upstream sees its native id. Other fields pass through untouched.
fn rewrite_model(body: &[u8], provider: &str) -> Result<(Vec<u8>, String), AppError> {
    let mut data: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AppError::internal(format!("failed to modify request body: {}", e)))?;

    let mut translated = String::new();
    if let Some(model) = data.get("model").and_then(|m| m.as_str()) {
        let prefix = format!("{}/", provider);
        translated = model.strip_prefix(&prefix).unwrap_or(model).to_string();
        data["model"] = serde_json::Value::String(translated.clone());
    }

    let encoded = serde_json::to_vec(&data)
        .map_err(|e| AppError::internal(format!("failed to modify request body: {}", e)))?;
    Ok((encoded, translated))
}

// The client's credentials must not leak upstream, and length/host are
// recomputed for the outbound request.
fn strip_request_headers(headers: &mut HeaderMap) {
    headers.remove(AUTHORIZATION);
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    headers.remove(CONNECTION);
    headers.remove(TRANSFER_ENCODING);
}

fn is_hop_header(name: &HeaderName) -> bool {
    *name == CONNECTION || *name == TRANSFER_ENCODING || *name == CONTENT_LENGTH
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderConfig, StrategyConfig};
    use crate::metrics::init_metrics_noop;
    use axum::extract::State;
    use axum::http::header::CONTENT_TYPE;
    use axum::http::{HeaderMap as AxumHeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::sync::mpsc;

    async fn spawn_upstream(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{}", addr)
    }

    /// Echoes back the model field and authorization header it received.
    fn echo_upstream() -> Router {
        Router::new().route(
            "/v1/chat/completions",
            post(|headers: AxumHeaderMap, body: Bytes| async move {
                let value: serde_json::Value = serde_json::from_slice(&body).expect("json");
                Json(serde_json::json!({
                    "seen_model": value["model"],
                    "seen_auth": headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or(""),
                    "seen_temperature": value["temperature"],
                }))
            }),
        )
    }

    fn provider(name: &str, target_url: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            enabled: true,
            target_url: target_url.to_string(),
            api_key: format!("{}-api-key", name),
            timeout_ms: 2_000,
            models: vec![],
        }
    }

    fn proxy_for(providers: &[ProviderConfig], strategies: &[StrategyConfig]) -> ProxyCore {
        let registry = Arc::new(ProviderRegistry::new(providers).expect("registry"));
        ProxyCore::new(registry, ModelRouter::new(strategies), init_metrics_noop())
    }

    fn chat_request(body: &str) -> Request {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, "Bearer client-token")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn response_json(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn rewrites_model_and_replaces_authorization() {
        let base = spawn_upstream(echo_upstream()).await;
        let proxy = proxy_for(&[provider("mock", &base)], &[]);

        let response = proxy
            .serve(chat_request(
                r#"{"model":"mock/gpt-x","messages":[{"role":"user","content":"hi"}],"temperature":0.5}"#,
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value["seen_model"], "gpt-x");
        assert_eq!(value["seen_auth"], "Bearer mock-api-key");
        assert_eq!(value["seen_temperature"], 0.5);
    }

    #[tokio::test]
    async fn falls_back_on_transport_failure() {
        let base = spawn_upstream(echo_upstream()).await;
        let providers = [provider("down", "http://127.0.0.1:9"), provider("up", &base)];
        let strategies = [StrategyConfig {
            name: "failover".to_string(),
            providers: vec!["down".to_string(), "up".to_string()],
        }];
        let proxy = proxy_for(&providers, &strategies);

        let response = proxy
            .serve(chat_request(r#"{"model":"failover","messages":[]}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value["seen_auth"], "Bearer up-api-key");
    }

    #[tokio::test]
    async fn missing_provider_in_chain_is_skipped() {
        let base = spawn_upstream(echo_upstream()).await;
        let providers = [provider("real", &base)];
        let strategies = [StrategyConfig {
            name: "mixed".to_string(),
            providers: vec!["ghost".to_string(), "real".to_string()],
        }];
        let proxy = proxy_for(&providers, &strategies);

        let response = proxy
            .serve(chat_request(r#"{"model":"mixed"}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn exhausted_chain_yields_service_unavailable() {
        let proxy = proxy_for(&[provider("down", "http://127.0.0.1:9")], &[]);

        let err = proxy
            .serve(chat_request(r#"{"model":"down/gpt-x"}"#))
            .await
            .expect_err("should fail");
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unknown_provider_prefix_yields_service_unavailable() {
        let proxy = proxy_for(&[], &[]);

        let err = proxy
            .serve(chat_request(r#"{"model":"nope/gpt-x"}"#))
            .await
            .expect_err("should fail");
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn invalid_model_yields_bad_request() {
        let proxy = proxy_for(&[], &[]);

        let err = proxy
            .serve(chat_request(r#"{"model":"no-slash"}"#))
            .await
            .expect_err("should fail");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_body_yields_payload_too_large() {
        let proxy = proxy_for(&[], &[]);
        let mut body = String::from(r#"{"model":"mock/gpt-x","padding":""#);
        body.push_str(&"x".repeat(MAX_BODY_BYTES));
        body.push_str(r#""}"#);

        let err = proxy
            .serve(chat_request(&body))
            .await
            .expect_err("should fail");
        assert_eq!(err.status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn non_success_status_is_forwarded_not_retried() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let failing = Router::new()
            .route(
                "/v1/chat/completions",
                post(
                    |State(hits): State<Arc<std::sync::atomic::AtomicUsize>>| async move {
                        hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        (StatusCode::BAD_GATEWAY, "upstream exploded")
                    },
                ),
            )
            .with_state(hits.clone());
        let failing_base = spawn_upstream(failing).await;
        let healthy_base = spawn_upstream(echo_upstream()).await;

        let providers = [provider("a", &failing_base), provider("b", &healthy_base)];
        let strategies = [StrategyConfig {
            name: "failover".to_string(),
            providers: vec!["a".to_string(), "b".to_string()],
        }];
        let proxy = proxy_for(&providers, &strategies);

        let response = proxy
            .serve(chat_request(r#"{"model":"failover"}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn completion_hook_receives_streamed_body() {
        let base = spawn_upstream(echo_upstream()).await;
        let registry = Arc::new(ProviderRegistry::new(&[provider("mock", &base)]).expect("registry"));
        let (tx, mut rx) = mpsc::channel::<(AttemptInfo, Bytes)>(1);
        let hook: ResponseHook = Arc::new(move |attempt, _response| {
            let tx = tx.clone();
            let attempt = attempt.clone();
            Some(Box::new(move |body: Bytes| {
                let _ = tx.try_send((attempt, body));
            }))
        });
        let proxy = ProxyCore::new(registry, ModelRouter::new(&[]), init_metrics_noop())
            .with_response_hook(hook);

        let response = proxy
            .serve(chat_request(r#"{"model":"mock/gpt-x"}"#))
            .await
            .expect("response");
        let client_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");

        let (attempt, hook_bytes) = rx.recv().await.expect("completion");
        assert_eq!(client_bytes, hook_bytes);
        assert_eq!(attempt.original_model, "mock/gpt-x");
        assert_eq!(attempt.provider, "mock");
        assert_eq!(attempt.translated_model, "gpt-x");
    }

    #[tokio::test]
    async fn streams_sse_chunks_and_fires_completion_once() {
        use tokio_stream::wrappers::ReceiverStream;

        let sse_upstream = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let (tx, rx) =
                    tokio::sync::mpsc::channel::<Result<Bytes, std::convert::Infallible>>(8);
                tokio::spawn(async move {
                    for i in 0..5 {
                        let chunk = format!("data: {{\"chunk\":{}}}\n\n", i);
                        let _ = tx.send(Ok(Bytes::from(chunk))).await;
                    }
                    let _ = tx.send(Ok(Bytes::from_static(b"data: [DONE]\n\n"))).await;
                });
                Response::builder()
                    .header(CONTENT_TYPE, "text/event-stream")
                    .body(Body::from_stream(ReceiverStream::new(rx)))
                    .expect("response")
            }),
        );
        let base = spawn_upstream(sse_upstream).await;

        let registry =
            Arc::new(ProviderRegistry::new(&[provider("mock", &base)]).expect("registry"));
        let (tx, mut rx) = mpsc::channel::<Bytes>(1);
        let hook: ResponseHook = Arc::new(move |_attempt, _response| {
            let tx = tx.clone();
            Some(Box::new(move |body: Bytes| {
                let _ = tx.try_send(body);
            }))
        });
        let proxy = ProxyCore::new(registry, ModelRouter::new(&[]), init_metrics_noop())
            .with_response_hook(hook);

        let response = proxy
            .serve(chat_request(r#"{"model":"mock/gpt-x","stream":true}"#))
            .await
            .expect("response");
        assert_eq!(
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );

        let client_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let client_text = String::from_utf8_lossy(&client_bytes).into_owned();
        for i in 0..5 {
            assert!(client_text.contains(&format!("{{\"chunk\":{}}}", i)));
        }
        assert!(client_text.ends_with("data: [DONE]\n\n"));

        let hook_bytes = rx.recv().await.expect("completion");
        assert_eq!(client_bytes, hook_bytes);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rewrite_strips_only_matching_prefix() {
        let (body, translated) =
            rewrite_model(br#"{"model":"mock/gpt-x","n":1}"#, "mock").expect("rewrite");
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["model"], "gpt-x");
        assert_eq!(value["n"], 1);
        assert_eq!(translated, "gpt-x");

        let (body, translated) =
            rewrite_model(br#"{"model":"other/gpt-x"}"#, "mock").expect("rewrite");
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["model"], "other/gpt-x");
        assert_eq!(translated, "other/gpt-x");
    }
}
