//! Text-to-speech: the backend seam and the pipeline-facing client.
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SynthesisError;
use crate::types::{AudioClip, SynthesisResult, SynthesizeRequest};
use crate::voice::Voice;

/// Default concurrent synthesis calls per session.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 3;
pub const DEFAULT_SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(30);

/// A text-to-speech service. Returns an encoded WAV clip.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: Voice) -> Result<Bytes, SynthesisError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiSpeechConfig {
    /// Includes the version segment, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub speed: f32,
}

impl Default for OpenAiSpeechConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            model: "tts-1".into(),
            speed: 1.15,
        }
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    speed: f32,
}

/// OpenAI `/audio/speech` backend.
pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    config: OpenAiSpeechConfig,
}

impl OpenAiSynthesizer {
    pub fn new(config: OpenAiSpeechConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str, voice: Voice) -> Result<Bytes, SynthesisError> {
        let url = format!("{}/audio/speech", self.config.base_url.trim_end_matches('/'));
        let body = SpeechRequest {
            model: &self.config.model,
            input: text,
            voice: voice.as_str(),
            response_format: "wav",
            speed: self.config.speed,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.bytes().await?)
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub max_in_flight: usize,
    pub timeout: Duration,
    /// Zero disables the clip cache.
    pub cache_size: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            timeout: DEFAULT_SYNTHESIS_TIMEOUT,
            cache_size: 64,
        }
    }
}

type ClipCache = LruCache<(Voice, String), Bytes>;

/// Wraps a [`Synthesizer`] with an in-flight cap, a per-call timeout,
/// cancellation and a small clip cache.
///
/// Cache hits return without taking a permit.
#[derive(Clone)]
pub struct SynthesisClient {
    backend: Arc<dyn Synthesizer>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    cache: Option<Arc<Mutex<ClipCache>>>,
}

impl SynthesisClient {
    pub fn new(backend: Arc<dyn Synthesizer>, config: SynthesisConfig) -> Self {
        let cache = NonZeroUsize::new(config.cache_size)
            .map(|size| Arc::new(Mutex::new(LruCache::new(size))));
        Self {
            backend,
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            timeout: config.timeout,
            cache,
        }
    }

    /// Synthesize one unit. Never fails outright: errors land in the result.
    pub async fn synthesize(
        &self,
        request: SynthesizeRequest,
        cancel: &CancellationToken,
    ) -> SynthesisResult {
        let started = Instant::now();
        let key = (request.voice, request.text);

        if let Some(bytes) = self.cached(&key).await {
            debug!(unit_id = request.unit_id, "synthesis cache hit");
            return SynthesisResult {
                unit_id: request.unit_id,
                session_id: request.session_id,
                outcome: Ok(AudioClip::new(bytes)),
                elapsed: started.elapsed(),
                cache_hit: true,
            };
        }

        let outcome = self.call_backend(&key, cancel).await;
        if let Ok(bytes) = &outcome {
            if let Some(cache) = &self.cache {
                cache.lock().await.put(key, bytes.clone());
            }
        }

        SynthesisResult {
            unit_id: request.unit_id,
            session_id: request.session_id,
            outcome: outcome.map(AudioClip::new),
            elapsed: started.elapsed(),
            cache_hit: false,
        }
    }

    async fn cached(&self, key: &(Voice, String)) -> Option<Bytes> {
        let cache = self.cache.as_ref()?;
        cache.lock().await.get(key).cloned()
    }

    async fn call_backend(
        &self,
        (voice, text): &(Voice, String),
        cancel: &CancellationToken,
    ) -> Result<Bytes, SynthesisError> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SynthesisError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| SynthesisError::Cancelled)?
            }
        };

        let call = tokio::time::timeout(self.timeout, self.backend.synthesize(text, *voice));
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SynthesisError::Cancelled),
            result = call => match result {
                Ok(result) => result?,
                Err(_) => {
                    warn!(timeout = ?self.timeout, "synthesis timed out");
                    return Err(SynthesisError::Timeout(self.timeout));
                }
            },
        };

        if bytes.is_empty() {
            return Err(SynthesisError::EmptyAudio);
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::types::SessionId;

    struct SlowBackend {
        delay: Duration,
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        body: Bytes,
    }

    impl SlowBackend {
        fn new(delay: Duration, body: &'static [u8]) -> Self {
            Self {
                delay,
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                body: Bytes::from_static(body),
            }
        }
    }

    #[async_trait]
    impl Synthesizer for SlowBackend {
        async fn synthesize(&self, _text: &str, _voice: Voice) -> Result<Bytes, SynthesisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(self.body.clone())
        }
    }

    fn request(unit_id: u64, text: &str) -> SynthesizeRequest {
        SynthesizeRequest {
            session_id: SessionId::new(),
            unit_id,
            text: text.to_string(),
            voice: Voice::Alloy,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn caps_concurrent_calls() {
        let backend = Arc::new(SlowBackend::new(Duration::from_secs(1), b"RIFF"));
        let client = SynthesisClient::new(
            backend.clone(),
            SynthesisConfig {
                max_in_flight: 2,
                cache_size: 0,
                ..Default::default()
            },
        );
        let token = CancellationToken::new();

        let calls = (1..=5).map(|i| {
            let client = client.clone();
            let token = token.clone();
            async move { client.synthesize(request(i, &format!("unit {i}")), &token).await }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.outcome.is_ok()));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 5);
        assert_eq!(backend.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_slow_calls() {
        let backend = Arc::new(SlowBackend::new(Duration::from_secs(60), b"RIFF"));
        let client = SynthesisClient::new(backend, SynthesisConfig::default());

        let result = client
            .synthesize(request(2, "slow one"), &CancellationToken::new())
            .await;
        assert!(matches!(result.outcome, Err(SynthesisError::Timeout(_))));
        assert_eq!(result.unit_id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_pending_call() {
        let backend = Arc::new(SlowBackend::new(Duration::from_secs(10), b"RIFF"));
        let client = SynthesisClient::new(backend, SynthesisConfig::default());
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let result = client.synthesize(request(1, "never mind"), &token).await;
        assert!(matches!(result.outcome, Err(SynthesisError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_audio_is_a_failure() {
        let backend = Arc::new(SlowBackend::new(Duration::ZERO, b""));
        let client = SynthesisClient::new(backend, SynthesisConfig::default());
        let result = client
            .synthesize(request(1, "hello"), &CancellationToken::new())
            .await;
        assert!(matches!(result.outcome, Err(SynthesisError::EmptyAudio)));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_text_hits_cache() {
        let backend = Arc::new(SlowBackend::new(Duration::from_millis(10), b"RIFF"));
        let client = SynthesisClient::new(backend.clone(), SynthesisConfig::default());
        let token = CancellationToken::new();

        let first = client.synthesize(request(1, "Sure thing."), &token).await;
        let second = client.synthesize(request(2, "Sure thing."), &token).await;
        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn openai_backend_posts_speech_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "tts-1",
                "input": "Hello there.",
                "voice": "nova",
                "response_format": "wav",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RIFFdata".to_vec()))
            .mount(&server)
            .await;

        let backend = OpenAiSynthesizer::new(OpenAiSpeechConfig {
            base_url: format!("{}/v1", server.uri()),
            api_key: Some("sk-test".into()),
            ..Default::default()
        });
        let bytes = backend.synthesize("Hello there.", Voice::Nova).await.unwrap();
        assert_eq!(&bytes[..], b"RIFFdata");
    }

    #[tokio::test]
    async fn openai_backend_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let backend = OpenAiSynthesizer::new(OpenAiSpeechConfig {
            base_url: server.uri(),
            ..Default::default()
        });
        let err = backend.synthesize("Hi.", Voice::Alloy).await.unwrap_err();
        assert!(matches!(err, SynthesisError::Status { status: 429, .. }));
    }
}
