//! The composed gateway engine: one value owning the credential store, token
//! manager, per-provider usage managers, schedulers, dispatchers, and batch
//! aggregators. Constructed once and passed by reference; there are no
//! ambient globals.

use crate::auth::registry::CredentialStore;
use crate::auth::tokens::TokenManager;
use crate::batch::{BatchAggregator, BatchConfig};
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::mapper::{join_model_id, split_model_id};
use crate::providers::{default_registry, AdapterRegistry, JobContext, ProviderAdapter};
use crate::scheduler::CredentialScheduler;
use crate::store::{ResilientWriter, StatePaths};
use crate::types::*;
use crate::usage::UsageManager;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Data root; defaults to `~/.aigate`.
    pub state_root: Option<PathBuf>,
    /// Owner-only permissions on persisted files.
    pub secure_files: bool,
    pub batch: BatchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { state_root: None, secure_files: true, batch: BatchConfig::default() }
    }
}

/// Everything the engine wires up for one provider.
pub struct ProviderRuntime {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub dispatcher: Arc<Dispatcher>,
    pub usage: Arc<UsageManager>,
    pub batches: Arc<BatchAggregator>,
}

pub struct Engine {
    paths: StatePaths,
    writer: ResilientWriter,
    store: Arc<CredentialStore>,
    tokens: TokenManager,
    providers: HashMap<String, ProviderRuntime>,
    background: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Build the engine with the default adapter registry.
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        // One connection pool serves every upstream call, token refreshes
        // included.
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(8)
            .build()?;
        let registry = default_registry(http.clone());
        Self::with_registry(config, registry, http)
    }

    /// Build the engine with an explicit registry (tests swap adapters in).
    pub fn with_registry(
        config: EngineConfig,
        registry: AdapterRegistry,
        http: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let paths = match &config.state_root {
            Some(root) => StatePaths::new(root.clone()),
            None => StatePaths::default_root(),
        };
        let writer = ResilientWriter::new(config.secure_files);
        let mut background = vec![writer.spawn_retry_ticker()];

        let tags = registry.tags();
        let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();
        let store = Arc::new(CredentialStore::open(paths.clone(), &tag_refs));
        let tokens = TokenManager::new(Arc::clone(&store), writer.clone(), http);

        let mut providers = HashMap::new();
        for adapter in registry.all() {
            let tag = adapter.tag().to_string();
            let usage = UsageManager::open(
                adapter.usage_config(),
                writer.clone(),
                paths.usage_file(&tag),
            );
            let scheduler = Arc::new(CredentialScheduler::new(
                Arc::clone(&adapter),
                Arc::clone(&store),
                tokens.clone(),
                Arc::clone(&usage),
            ));
            let dispatcher =
                Arc::new(Dispatcher::new(Arc::clone(&adapter), scheduler, tokens.clone()));
            let batches = BatchAggregator::new(Arc::clone(&dispatcher), config.batch);

            if let Some(job) = adapter.background_job() {
                background.push(spawn_background_job(
                    Arc::clone(&adapter),
                    job,
                    JobContext {
                        store: Arc::clone(&store),
                        tokens: tokens.clone(),
                        usage: Arc::clone(&usage),
                    },
                ));
            }

            providers.insert(tag, ProviderRuntime { adapter, dispatcher, usage, batches });
        }

        Ok(Self {
            paths,
            writer,
            store,
            tokens,
            providers,
            background: std::sync::Mutex::new(background),
        })
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn writer(&self) -> &ResilientWriter {
        &self.writer
    }

    pub fn provider(&self, tag: &str) -> Option<&ProviderRuntime> {
        self.providers.get(tag)
    }

    pub fn provider_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.providers.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Full catalog: `(provider/model, definition)` across all adapters.
    pub fn models(&self) -> Vec<(String, ModelDef)> {
        let mut models = Vec::new();
        for tag in self.provider_tags() {
            let runtime = &self.providers[&tag];
            for def in runtime.adapter.models() {
                models.push((join_model_id(&tag, &def.id), def));
            }
        }
        models
    }

    pub fn find_model(&self, full_id: &str) -> Option<ModelDef> {
        let (provider, short) = split_model_id(full_id)?;
        self.providers
            .get(provider)?
            .adapter
            .models()
            .into_iter()
            .find(|def| def.id == short)
    }

    fn resolve(&self, full_model_id: &str) -> Result<(&ProviderRuntime, String), GatewayError> {
        let (provider, short) = split_model_id(full_model_id).ok_or_else(|| {
            GatewayError::NotFound(format!("invalid model id: {full_model_id}"))
        })?;
        let runtime = self
            .providers
            .get(provider)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown provider: {provider}")))?;
        Ok((runtime, short.to_string()))
    }

    /// Non-streaming chat against `provider/model`.
    pub async fn chat(
        &self,
        full_model_id: &str,
        mut request: ChatRequest,
        deadline: Instant,
    ) -> Result<AssistantMessage, GatewayError> {
        let (runtime, short) = self.resolve(full_model_id)?;
        request.model = short;
        let mut message = runtime.dispatcher.execute_chat(&request, deadline).await?;
        message.model = join_model_id(runtime.adapter.tag(), &message.model);
        Ok(message)
    }

    /// Streaming chat against `provider/model`.
    pub async fn stream(
        &self,
        full_model_id: &str,
        mut request: ChatRequest,
        deadline: Instant,
    ) -> Result<BoxStream<'static, Result<StreamEvent, GatewayError>>, GatewayError> {
        let (runtime, short) = self.resolve(full_model_id)?;
        request.model = short;
        runtime.dispatcher.execute_stream(&request, deadline).await
    }

    /// Batched embeddings against `provider/model`.
    pub async fn embed(
        &self,
        full_model_id: &str,
        mut request: EmbeddingRequest,
        deadline: Instant,
    ) -> Result<EmbeddingResponse, GatewayError> {
        let (runtime, short) = self.resolve(full_model_id)?;
        request.model = short;
        let mut response = runtime.batches.embed(request, deadline).await?;
        response.model = join_model_id(runtime.adapter.tag(), &response.model);
        Ok(response)
    }

    /// Stop background work and flush all state. Returns the number of
    /// writes still pending after the flush (non-zero means data loss risk).
    pub fn shutdown(&self) -> usize {
        for handle in self.background.lock().expect("background tasks lock").drain(..) {
            handle.abort();
        }
        for runtime in self.providers.values() {
            runtime.usage.flush();
        }
        self.writer.flush()
    }
}

fn spawn_background_job(
    adapter: Arc<dyn ProviderAdapter>,
    job: crate::providers::BackgroundJobSpec,
    ctx: JobContext,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(job.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        if !job.run_on_start {
            ticker.tick().await;
        }
        loop {
            ticker.tick().await;
            if let Err(e) = adapter.run_background_job(&ctx).await {
                tracing::warn!(job = job.name, error = %e, "background job failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn engine_builds_with_default_registry() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(EngineConfig {
            state_root: Some(dir.path().to_path_buf()),
            secure_files: false,
            batch: BatchConfig::default(),
        })
        .unwrap();

        assert_eq!(engine.provider_tags(), vec!["google-oauth", "openai"]);
        let models = engine.models();
        assert!(models.iter().any(|(id, _)| id == "openai/gpt-4o"));
        assert!(models.iter().any(|(id, _)| id == "google-oauth/gemini-2.5-pro"));
        assert!(engine.find_model("openai/gpt-4o").is_some());
        assert!(engine.find_model("openai/none-such").is_none());

        assert_eq!(engine.shutdown(), 0);
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(EngineConfig {
            state_root: Some(dir.path().to_path_buf()),
            secure_files: false,
            batch: BatchConfig::default(),
        })
        .unwrap();

        let err = engine
            .chat(
                "nope/model-x",
                ChatRequest::default(),
                Instant::now() + Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert_eq!(err.http_status(), 404);
    }
}
