// Pipeline metrics collection and tracking

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

const MAX_SAMPLES: usize = 1000;

/// Latency distribution over the most recent samples
#[derive(Debug, Clone)]
pub struct LatencyStats {
    count: Arc<AtomicU64>,
    total_ms: Arc<AtomicU64>,
    min_ms: Arc<AtomicU64>,
    max_ms: Arc<AtomicU64>,
    samples: Arc<Mutex<Vec<u64>>>,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicU64::new(0)),
            total_ms: Arc::new(AtomicU64::new(0)),
            min_ms: Arc::new(AtomicU64::new(u64::MAX)),
            max_ms: Arc::new(AtomicU64::new(0)),
            samples: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.min_ms.fetch_min(latency_ms, Ordering::Relaxed);
        self.max_ms.fetch_max(latency_ms, Ordering::Relaxed);

        // Keep the last MAX_SAMPLES for percentiles
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(latency_ms);
            if samples.len() > MAX_SAMPLES {
                samples.remove(0);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn avg_ms(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.total_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    fn percentile(&self, p: u8) -> u64 {
        let Ok(samples) = self.samples.lock() else {
            return 0;
        };
        if samples.is_empty() {
            return 0;
        }
        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let index = (sorted.len() * p as usize / 100).min(sorted.len() - 1);
        sorted[index]
    }

    pub fn stats(&self) -> LatencyReport {
        let count = self.count();
        LatencyReport {
            count,
            avg_ms: self.avg_ms(),
            min_ms: if count == 0 { 0 } else { self.min_ms.load(Ordering::Relaxed) },
            max_ms: self.max_ms.load(Ordering::Relaxed),
            p50_ms: self.percentile(50),
            p95_ms: self.percentile(95),
            p99_ms: self.percentile(99),
        }
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for sessions, units, playback and the synthesis cache
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub sessions_started: AtomicU64,
    pub sessions_completed: AtomicU64,
    pub sessions_cancelled: AtomicU64,
    pub sessions_failed: AtomicU64,
    pub units_dispatched: AtomicU64,
    pub units_synthesized: AtomicU64,
    pub units_skipped: AtomicU64,
    pub units_played: AtomicU64,
    pub playback_failures: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub synthesis_latency: LatencyStats,
    pub first_audio_latency: LatencyStats,
    started_at: Option<std::time::Instant>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Some(std::time::Instant::now()),
            ..Default::default()
        }
    }

    pub fn session_started(&self) {
        bump(&self.sessions_started);
    }

    pub fn session_completed(&self) {
        bump(&self.sessions_completed);
    }

    pub fn session_cancelled(&self) {
        bump(&self.sessions_cancelled);
    }

    pub fn session_failed(&self) {
        bump(&self.sessions_failed);
    }

    pub fn unit_dispatched(&self) {
        bump(&self.units_dispatched);
    }

    pub fn unit_synthesized(&self, elapsed: Duration, cache_hit: bool) {
        bump(&self.units_synthesized);
        if cache_hit {
            bump(&self.cache_hits);
        } else {
            bump(&self.cache_misses);
            self.synthesis_latency.record(elapsed);
        }
    }

    pub fn unit_skipped(&self) {
        bump(&self.units_skipped);
    }

    pub fn unit_played(&self) {
        bump(&self.units_played);
    }

    pub fn playback_failed(&self) {
        bump(&self.playback_failures);
    }

    pub fn first_audio(&self, latency: Duration) {
        self.first_audio_latency.record(latency);
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        (hits as f64 / total as f64) * 100.0
    }

    pub fn snapshot(&self) -> MetricsResponse {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsResponse {
            timestamp: Utc::now(),
            uptime_seconds: self.started_at.map_or(0, |t| t.elapsed().as_secs()),
            sessions: SessionCounts {
                started: load(&self.sessions_started),
                completed: load(&self.sessions_completed),
                cancelled: load(&self.sessions_cancelled),
                failed: load(&self.sessions_failed),
            },
            units: UnitCounts {
                dispatched: load(&self.units_dispatched),
                synthesized: load(&self.units_synthesized),
                skipped: load(&self.units_skipped),
                played: load(&self.units_played),
                playback_failures: load(&self.playback_failures),
            },
            synthesis: SynthesisReport {
                cache_hits: load(&self.cache_hits),
                cache_misses: load(&self.cache_misses),
                cache_hit_rate: self.cache_hit_rate(),
                latency: self.synthesis_latency.stats(),
            },
            first_audio: self.first_audio_latency.stats(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub sessions: SessionCounts,
    pub units: UnitCounts,
    pub synthesis: SynthesisReport,
    pub first_audio: LatencyReport,
}

#[derive(Debug, Serialize)]
pub struct SessionCounts {
    pub started: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

#[derive(Debug, Serialize)]
pub struct UnitCounts {
    pub dispatched: u64,
    pub synthesized: u64,
    pub skipped: u64,
    pub played: u64,
    pub playback_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct SynthesisReport {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub latency: LatencyReport,
}

#[derive(Debug, Serialize)]
pub struct LatencyReport {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}
