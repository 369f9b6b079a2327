use aigate::translate::stream::{openai_stream_chunk, AnthropicEventEncoder};
use aigate::translate::{
    anthropic_error_body, anthropic_message_response, chat_request_from_anthropic,
    chat_request_from_openai, openai_chat_response, openai_error_body,
};
use aigate::types::{estimate_request_tokens, estimate_tokens, ModelDef};
use aigate::{deadline_after, Engine, GatewayError};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// TTL of the filtered model catalog served by GET /v1/models.
const MODELS_CACHE_TTL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub engine: Engine,
    /// Client API key; empty disables auth entirely.
    pub proxy_api_key: String,
    /// Optional allow-list of full model ids (`provider/model`).
    pub enabled_models: Option<Vec<String>>,
    /// Global per-request budget.
    pub request_timeout: Duration,
    models_cache: RwLock<Option<(Instant, Vec<(String, ModelDef)>)>>,
}

impl AppState {
    pub fn new(
        engine: Engine,
        proxy_api_key: String,
        enabled_models: Option<Vec<String>>,
        request_timeout: Duration,
    ) -> Self {
        if proxy_api_key.is_empty() {
            tracing::warn!("proxy API key is empty: client authentication is DISABLED");
        }
        Self {
            engine,
            proxy_api_key,
            enabled_models,
            request_timeout,
            models_cache: RwLock::new(None),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        if self.proxy_api_key.is_empty() {
            return true;
        }
        let bearer = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok()).map(str::trim);
        bearer == Some(self.proxy_api_key.as_str()) || api_key == Some(self.proxy_api_key.as_str())
    }

    /// Filtered model catalog, cached with a TTL.
    async fn models(&self) -> Vec<(String, ModelDef)> {
        {
            let cache = self.models_cache.read().await;
            if let Some((at, models)) = cache.as_ref() {
                if at.elapsed() < MODELS_CACHE_TTL {
                    return models.clone();
                }
            }
        }
        let mut models = self.engine.models();
        if let Some(enabled) = &self.enabled_models {
            models.retain(|(id, _)| enabled.contains(id));
        }
        *self.models_cache.write().await = Some((Instant::now(), models.clone()));
        models
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/models", get(list_models))
        .route("/v1/models/{id}", get(get_model))
        .route("/v1/providers", get(list_providers))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/v1/token-count", post(token_count))
        .route("/v1/cost-estimate", post(cost_estimate))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"type": "authentication_error", "message": "invalid proxy API key"}})),
    )
        .into_response()
}

fn openai_failure(error: &GatewayError) -> Response {
    let status = StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = openai_error_body(error);
    if let GatewayError::NoKeyAvailable { next_reset_ms: Some(reset), .. } = error {
        body["error"]["next_reset_ms"] = json!(reset);
    }
    (status, Json(body)).into_response()
}

fn anthropic_failure(error: &GatewayError) -> Response {
    let status = StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = anthropic_error_body(error);
    if let GatewayError::NoKeyAvailable { next_reset_ms: Some(reset), .. } = error {
        body["error"]["next_reset_ms"] = json!(reset);
    }
    (status, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Catalog endpoints
// ---------------------------------------------------------------------------

async fn list_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    let data: Vec<Value> = state
        .models()
        .await
        .into_iter()
        .map(|(full_id, def)| model_object(&full_id, &def))
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

async fn get_model(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    match state.models().await.into_iter().find(|(full_id, _)| *full_id == id) {
        Some((full_id, def)) => Json(model_object(&full_id, &def)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"message": format!("model not found: {id}")}})),
        )
            .into_response(),
    }
}

fn model_object(full_id: &str, def: &ModelDef) -> Value {
    json!({
        "id": full_id,
        "object": "model",
        "created": 0,
        "owned_by": def.provider,
        "context_window": def.context_window,
        "max_output_tokens": def.max_tokens,
    })
}

async fn list_providers(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    let providers: Vec<Value> = state
        .engine
        .provider_tags()
        .into_iter()
        .filter_map(|tag| {
            let runtime = state.engine.provider(&tag)?;
            let models: Vec<String> = runtime.adapter.models().iter().map(|m| m.id.clone()).collect();
            Some(json!({
                "id": tag,
                "models": models,
                "credentials": state.engine.store().list(&tag).len(),
            }))
        })
        .collect();
    Json(json!({"providers": providers})).into_response()
}

// ---------------------------------------------------------------------------
// POST /v1/chat/completions (OpenAI dialect)
// ---------------------------------------------------------------------------

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    let request = match chat_request_from_openai(&body) {
        Ok(request) => request,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(openai_error_body(&e))).into_response();
        }
    };
    let model = request.model.clone();
    let deadline = deadline_after(state.request_timeout);

    if request.stream {
        let stream = match state.engine.stream(&model, request, deadline).await {
            Ok(stream) => stream,
            Err(e) => return openai_failure(&e),
        };
        let chunk_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
        let sse = stream.filter_map(move |event| {
            let model = model.clone();
            let chunk_id = chunk_id.clone();
            async move {
                match event {
                    Ok(event) => openai_stream_chunk(&event, &model, &chunk_id)
                        .map(|chunk| Ok::<_, Infallible>(Event::default().data(chunk.to_string()))),
                    Err(e) => Some(Ok(Event::default().data(openai_error_body(&e).to_string()))),
                }
            }
        });
        // OpenAI streams terminate with a literal [DONE].
        let done = futures::stream::once(async {
            Ok::<_, Infallible>(Event::default().data("[DONE]"))
        });
        Sse::new(sse.chain(done)).into_response()
    } else {
        match state.engine.chat(&model, request, deadline).await {
            Ok(message) => Json(openai_chat_response(&message, &model)).into_response(),
            Err(e) => openai_failure(&e),
        }
    }
}

// ---------------------------------------------------------------------------
// POST /v1/embeddings
// ---------------------------------------------------------------------------

async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    let model = match body.get("model").and_then(Value::as_str) {
        Some(model) => model.to_string(),
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"message": "missing model"}})),
            )
                .into_response();
        }
    };
    let inputs = match body.get("input") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"message": "missing input"}})),
            )
                .into_response();
        }
    };
    let request = aigate::types::EmbeddingRequest {
        model: model.clone(),
        inputs,
        dimensions: body.get("dimensions").and_then(Value::as_u64).map(|d| d as u32),
    };
    let deadline = deadline_after(state.request_timeout);

    match state.engine.embed(&model, request, deadline).await {
        Ok(response) => {
            let data: Vec<Value> = response
                .vectors
                .iter()
                .enumerate()
                .map(|(index, embedding)| {
                    json!({"object": "embedding", "index": index, "embedding": embedding})
                })
                .collect();
            Json(json!({
                "object": "list",
                "model": response.model,
                "data": data,
                "usage": {
                    "prompt_tokens": response.usage.input_tokens,
                    "total_tokens": response.usage.total_tokens,
                },
            }))
            .into_response()
        }
        Err(e) => openai_failure(&e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/messages (Anthropic dialect)
// ---------------------------------------------------------------------------

async fn anthropic_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    let request = match chat_request_from_anthropic(&body) {
        Ok(request) => request,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(anthropic_error_body(&e))).into_response();
        }
    };
    let model = request.model.clone();
    let deadline = deadline_after(state.request_timeout);

    if request.stream {
        let stream = match state.engine.stream(&model, request, deadline).await {
            Ok(stream) => stream,
            Err(e) => return anthropic_failure(&e),
        };
        let mut encoder = AnthropicEventEncoder::new(&model);
        let sse = stream.flat_map(move |event| {
            let frames: Vec<Result<Event, Infallible>> = match event {
                Ok(event) => encoder
                    .encode(&event)
                    .into_iter()
                    .map(|frame| {
                        Ok(Event::default().event(frame.event).data(frame.data.to_string()))
                    })
                    .collect(),
                Err(e) => vec![Ok(Event::default()
                    .event("error")
                    .data(anthropic_error_body(&e).to_string()))],
            };
            futures::stream::iter(frames)
        });
        Sse::new(sse).into_response()
    } else {
        match state.engine.chat(&model, request, deadline).await {
            Ok(message) => Json(anthropic_message_response(&message, &model)).into_response(),
            Err(e) => anthropic_failure(&e),
        }
    }
}

// ---------------------------------------------------------------------------
// Stateless helpers
// ---------------------------------------------------------------------------

async fn count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    match chat_request_from_anthropic(&body) {
        Ok(request) => {
            Json(json!({"input_tokens": estimate_request_tokens(&request)})).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(anthropic_error_body(&e))).into_response(),
    }
}

async fn token_count(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    let text = body.get("text").and_then(Value::as_str).unwrap_or("");
    Json(json!({"tokens": estimate_tokens(text)})).into_response()
}

async fn cost_estimate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    let model_id = body.get("model").and_then(Value::as_str).unwrap_or("");
    let Some(def) = state.engine.find_model(model_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"message": format!("model not found: {model_id}")}})),
        )
            .into_response();
    };
    let input = body.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as f64;
    let output = body.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as f64;
    let cost = (input * def.cost.input + output * def.cost.output) / 1_000_000.0;
    Json(json!({
        "model": model_id,
        "input_tokens": input as u64,
        "output_tokens": output as u64,
        "estimated_cost_usd": cost,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigate::{BatchConfig, EngineConfig};
    use axum::http::header::HeaderValue;

    async fn test_state(proxy_key: &str) -> (tempfile::TempDir, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(EngineConfig {
            state_root: Some(dir.path().to_path_buf()),
            secure_files: false,
            batch: BatchConfig::default(),
        })
        .unwrap();
        let state = Arc::new(AppState::new(
            engine,
            proxy_key.to_string(),
            None,
            Duration::from_secs(30),
        ));
        (dir, state)
    }

    #[tokio::test]
    async fn auth_accepts_bearer_and_x_api_key() {
        let (_dir, state) = test_state("secret").await;

        let mut headers = HeaderMap::new();
        assert!(!state.authorized(&headers));

        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        assert!(state.authorized(&headers));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("secret"));
        assert!(state.authorized(&headers));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("wrong"));
        assert!(!state.authorized(&headers));
    }

    #[tokio::test]
    async fn empty_proxy_key_disables_auth() {
        let (_dir, state) = test_state("").await;
        assert!(state.authorized(&HeaderMap::new()));
    }

    #[tokio::test]
    async fn models_catalog_is_cached_and_filterable() {
        let (_dir, state) = test_state("").await;
        let models = state.models().await;
        assert!(models.iter().any(|(id, _)| id == "openai/gpt-4o"));

        // Second read hits the cache (same content).
        let again = state.models().await;
        assert_eq!(models.len(), again.len());
    }
}
