//! Embedding batch aggregation: requests for the same (provider, model,
//! options) coalesce into one upstream call when the queue reaches the batch
//! size or a short window elapses.

use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::types::{EmbeddingRequest, EmbeddingResponse, Usage};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub batch_size: usize,
    /// Flush this long after the first item queued.
    pub max_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { batch_size: 64, max_delay: Duration::from_millis(100) }
    }
}

/// Stable key for batchable-equivalent requests.
fn fingerprint(provider: &str, model: &str, dimensions: Option<u32>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update([0]);
    hasher.update(model.as_bytes());
    hasher.update([0]);
    hasher.update(dimensions.unwrap_or(0).to_le_bytes());
    format!("{:x}", hasher.finalize())
}

struct PendingRequest {
    inputs: Vec<String>,
    deadline: Instant,
    tx: oneshot::Sender<Result<EmbeddingResponse, GatewayError>>,
}

#[derive(Default)]
struct Queue {
    model: String,
    dimensions: Option<u32>,
    requests: Vec<PendingRequest>,
    total_inputs: usize,
    timer_armed: bool,
}

pub struct BatchAggregator {
    dispatcher: Arc<Dispatcher>,
    config: BatchConfig,
    queues: Mutex<HashMap<String, Queue>>,
}

impl BatchAggregator {
    pub fn new(dispatcher: Arc<Dispatcher>, config: BatchConfig) -> Arc<Self> {
        Arc::new(Self { dispatcher, config, queues: Mutex::new(HashMap::new()) })
    }

    /// Queue the request and wait for its slice of the batched result.
    pub async fn embed(
        self: &Arc<Self>,
        request: EmbeddingRequest,
        deadline: Instant,
    ) -> Result<EmbeddingResponse, GatewayError> {
        if request.inputs.is_empty() {
            return Ok(EmbeddingResponse {
                model: request.model,
                vectors: Vec::new(),
                usage: Usage::default(),
            });
        }

        let (tx, rx) = oneshot::channel();
        let key = fingerprint(
            self.dispatcher.adapter().tag(),
            &request.model,
            request.dimensions,
        );

        let ready = {
            let mut queues = self.queues.lock().expect("batch queues lock");
            let queue = queues.entry(key.clone()).or_insert_with(|| Queue {
                model: request.model.clone(),
                dimensions: request.dimensions,
                ..Queue::default()
            });
            queue.total_inputs += request.inputs.len();
            queue.requests.push(PendingRequest {
                inputs: request.inputs,
                deadline,
                tx,
            });

            if queue.total_inputs >= self.config.batch_size {
                Some(take_batch(queue, self.config.batch_size))
            } else {
                if !queue.timer_armed {
                    queue.timer_armed = true;
                    let aggregator = Arc::clone(self);
                    let key = key.clone();
                    let delay = self.config.max_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        aggregator.flush_timer(&key).await;
                    });
                }
                None
            }
        };

        if let Some(batch) = ready {
            let aggregator = Arc::clone(self);
            tokio::spawn(async move { aggregator.run_batch(batch).await });
        }

        rx.await
            .map_err(|_| GatewayError::Other("batch worker dropped the request".into()))?
    }

    async fn flush_timer(self: &Arc<Self>, key: &str) {
        let batch = {
            let mut queues = self.queues.lock().expect("batch queues lock");
            let Some(queue) = queues.get_mut(key) else { return };
            queue.timer_armed = false;
            if queue.requests.is_empty() {
                return;
            }
            take_batch(queue, usize::MAX)
        };
        self.run_batch(batch).await;
    }

    async fn run_batch(&self, batch: Batch) {
        let inputs: Vec<String> = batch
            .requests
            .iter()
            .flat_map(|r| r.inputs.iter().cloned())
            .collect();
        let total_inputs = inputs.len();
        // The strictest member bounds the whole upstream call.
        let deadline = batch
            .requests
            .iter()
            .map(|r| r.deadline)
            .min()
            .unwrap_or_else(Instant::now);

        let upstream = EmbeddingRequest {
            model: batch.model.clone(),
            inputs,
            dimensions: batch.dimensions,
        };
        tracing::debug!(
            model = %batch.model,
            requests = batch.requests.len(),
            inputs = total_inputs,
            "flushing embedding batch"
        );

        match self.dispatcher.execute_embeddings(&upstream, deadline).await {
            Ok(response) => distribute(batch, response, total_inputs),
            Err(error) => {
                for request in batch.requests {
                    let _ = request.tx.send(Err(error.replicate()));
                }
            }
        }
    }
}

struct Batch {
    model: String,
    dimensions: Option<u32>,
    requests: Vec<PendingRequest>,
}

/// Remove whole requests from the queue until `limit` inputs are taken. A
/// single oversized request is taken alone.
fn take_batch(queue: &mut Queue, limit: usize) -> Batch {
    let mut taken = Vec::new();
    let mut inputs = 0;
    while let Some(next) = queue.requests.first() {
        let size = next.inputs.len();
        if !taken.is_empty() && inputs + size > limit {
            break;
        }
        inputs += size;
        taken.push(queue.requests.remove(0));
        if inputs >= limit {
            break;
        }
    }
    queue.total_inputs -= inputs;
    Batch { model: queue.model.clone(), dimensions: queue.dimensions, requests: taken }
}

/// Hand each request its vector slice and a proportional share of the
/// upstream usage; shares sum exactly to the upstream total.
fn distribute(batch: Batch, response: EmbeddingResponse, total_inputs: usize) {
    if response.vectors.len() != total_inputs {
        let error = GatewayError::Server {
            status: 502,
            detail: format!(
                "embedding count mismatch: sent {total_inputs}, got {}",
                response.vectors.len()
            ),
        };
        for request in batch.requests {
            let _ = request.tx.send(Err(error.replicate()));
        }
        return;
    }

    let total_tokens = response.usage.total_tokens;
    let input_tokens = response.usage.input_tokens;
    let mut vectors = response.vectors.into_iter();
    let mut tokens_handed = 0u64;
    let mut input_handed = 0u64;
    let mut inputs_seen = 0usize;

    let request_count = batch.requests.len();
    for (position, request) in batch.requests.into_iter().enumerate() {
        let slice: Vec<Vec<f32>> = vectors.by_ref().take(request.inputs.len()).collect();
        inputs_seen += request.inputs.len();

        // Last request absorbs the rounding remainder.
        let (share_total, share_input) = if position + 1 == request_count {
            (total_tokens - tokens_handed, input_tokens - input_handed)
        } else {
            let fraction = inputs_seen as f64 / total_inputs as f64;
            let cumulative_total = (total_tokens as f64 * fraction).floor() as u64;
            let cumulative_input = (input_tokens as f64 * fraction).floor() as u64;
            let share = (cumulative_total - tokens_handed, cumulative_input - input_handed);
            tokens_handed = cumulative_total;
            input_handed = cumulative_input;
            share
        };

        let _ = request.tx.send(Ok(EmbeddingResponse {
            model: response.model.clone(),
            vectors: slice,
            usage: Usage {
                input_tokens: share_input,
                output_tokens: 0,
                total_tokens: share_total,
                ..Usage::default()
            },
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::registry::CredentialStore;
    use crate::auth::tokens::TokenManager;
    use crate::providers::{AdapterAuth, ProviderAdapter};
    use crate::scheduler::CredentialScheduler;
    use crate::store::{ResilientWriter, StatePaths};
    use crate::types::*;
    use crate::usage::{UsageConfig, UsageManager};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Embedding upstream returning one-hot vectors and 10 tokens per input.
    struct EmbedAdapter {
        calls: AtomicU32,
        sizes: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl ProviderAdapter for EmbedAdapter {
        fn tag(&self) -> &str {
            "testprov"
        }

        fn models(&self) -> Vec<ModelDef> {
            Vec::new()
        }

        fn usage_config(&self) -> UsageConfig {
            UsageConfig::new("testprov")
        }

        async fn chat(
            &self,
            _request: &ChatRequest,
            _auth: &AdapterAuth,
        ) -> Result<AssistantMessage, GatewayError> {
            Err(GatewayError::Other("chat unused".into()))
        }

        fn stream_chat(
            &self,
            _request: &ChatRequest,
            _auth: &AdapterAuth,
        ) -> futures::stream::BoxStream<'static, Result<StreamEvent, GatewayError>> {
            Box::pin(futures::stream::empty())
        }

        async fn embed(
            &self,
            request: &EmbeddingRequest,
            _auth: &AdapterAuth,
        ) -> Result<EmbeddingResponse, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sizes.lock().unwrap().push(request.inputs.len());
            let count = request.inputs.len();
            Ok(EmbeddingResponse {
                model: request.model.clone(),
                vectors: (0..count).map(|i| vec![i as f32]).collect(),
                usage: Usage {
                    input_tokens: 10 * count as u64,
                    output_tokens: 0,
                    total_tokens: 10 * count as u64,
                    ..Usage::default()
                },
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        aggregator: Arc<BatchAggregator>,
        adapter: Arc<EmbedAdapter>,
    }

    async fn fixture(config: BatchConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        let path = paths.oauth_cred_file("testprov", 0);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            json!({
                "access_token": "at",
                "refresh_token": "rt",
                "expiry_date": i64::MAX,
                "token_uri": "https://oauth2.example/token",
                "_proxy_metadata": {"email": "u@example.com"}
            })
            .to_string(),
        )
        .unwrap();

        let adapter = Arc::new(EmbedAdapter {
            calls: AtomicU32::new(0),
            sizes: Mutex::new(Vec::new()),
        });
        let trait_adapter: Arc<dyn ProviderAdapter> = adapter.clone();
        let store = Arc::new(CredentialStore::open(paths.clone(), &["testprov"]));
        let writer = ResilientWriter::new(false);
        let usage = UsageManager::open(
            trait_adapter.usage_config(),
            writer.clone(),
            paths.usage_file("testprov"),
        );
        let tokens = TokenManager::new(Arc::clone(&store), writer, reqwest::Client::new());
        let scheduler = Arc::new(CredentialScheduler::new(
            Arc::clone(&trait_adapter),
            store,
            tokens.clone(),
            usage,
        ));
        let dispatcher = Arc::new(Dispatcher::new(trait_adapter, scheduler, tokens));
        Fixture {
            _dir: dir,
            aggregator: BatchAggregator::new(dispatcher, config),
            adapter,
        }
    }

    fn single_input_request(text: &str) -> EmbeddingRequest {
        EmbeddingRequest { model: "embed-1".into(), inputs: vec![text.to_string()], dimensions: None }
    }

    #[tokio::test(start_paused = true)]
    async fn sixty_five_requests_make_two_upstream_calls() {
        let f = fixture(BatchConfig::default()).await;
        let deadline = Instant::now() + Duration::from_secs(10);

        let mut handles = Vec::new();
        for index in 0..65 {
            let aggregator = Arc::clone(&f.aggregator);
            handles.push(tokio::spawn(async move {
                aggregator
                    .embed(single_input_request(&format!("text {index}")), deadline)
                    .await
            }));
        }

        let mut attributed_total = 0u64;
        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.vectors.len(), 1);
            attributed_total += response.usage.total_tokens;
        }

        assert_eq!(f.adapter.calls.load(Ordering::SeqCst), 2);
        let mut sizes = f.adapter.sizes.lock().unwrap().clone();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 64]);
        // Attribution sums to the upstream totals, not 65x them.
        assert_eq!(attributed_total, 65 * 10);
    }

    #[tokio::test(start_paused = true)]
    async fn small_batch_flushes_on_timer() {
        let f = fixture(BatchConfig::default()).await;
        let deadline = Instant::now() + Duration::from_secs(10);

        let a = {
            let aggregator = Arc::clone(&f.aggregator);
            tokio::spawn(async move { aggregator.embed(single_input_request("a"), deadline).await })
        };
        let b = {
            let aggregator = Arc::clone(&f.aggregator);
            tokio::spawn(async move { aggregator.embed(single_input_request("b"), deadline).await })
        };

        let first = a.await.unwrap().unwrap();
        let second = b.await.unwrap().unwrap();
        assert_eq!(f.adapter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.vectors.len(), 1);
        assert_eq!(second.vectors.len(), 1);
        // Two distinct slices of the same batch.
        assert_ne!(first.vectors[0], second.vectors[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn different_options_use_separate_batches() {
        let f = fixture(BatchConfig::default()).await;
        let deadline = Instant::now() + Duration::from_secs(10);

        let mut with_dims = single_input_request("a");
        with_dims.dimensions = Some(256);
        let a = {
            let aggregator = Arc::clone(&f.aggregator);
            tokio::spawn(async move { aggregator.embed(with_dims, deadline).await })
        };
        let b = {
            let aggregator = Arc::clone(&f.aggregator);
            tokio::spawn(async move { aggregator.embed(single_input_request("b"), deadline).await })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(f.adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn multi_input_request_keeps_order() {
        let f = fixture(BatchConfig::default()).await;
        let deadline = Instant::now() + Duration::from_secs(10);
        let request = EmbeddingRequest {
            model: "embed-1".into(),
            inputs: vec!["x".into(), "y".into(), "z".into()],
            dimensions: None,
        };
        let response = f.aggregator.embed(request, deadline).await.unwrap();
        assert_eq!(response.vectors, vec![vec![0.0], vec![1.0], vec![2.0]]);
        assert_eq!(response.usage.total_tokens, 30);
    }
}
