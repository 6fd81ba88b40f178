//! Single-clip player over an [`AudioSink`].
//!
//! [`AudioPlayerController`] owns the output exclusively and tracks at most
//! one clip at a time. Completion is observed through
//! [`AudioPlayerController::finished`], which never resolves while idle.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PlaybackError;
use crate::queue::PlayItem;
use crate::types::{AudioClip, SessionId, UnitId};
use crate::wav;

/// Something that can render one clip and report when it is done.
///
/// `play` resolves when the clip has finished or `stop` fired.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, clip: AudioClip, stop: CancellationToken) -> Result<(), PlaybackError>;
}

/// Plays nothing; waits for the clip's real duration.
///
/// Used headless and in tests, where the tokio clock can be paused.
#[derive(Debug, Default, Clone)]
pub struct ClockSink;

#[async_trait]
impl AudioSink for ClockSink {
    async fn play(&self, clip: AudioClip, stop: CancellationToken) -> Result<(), PlaybackError> {
        let info = wav::inspect(&clip.bytes)?;
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::time::sleep(info.duration) => {}
        }
        Ok(())
    }
}

#[cfg(feature = "device-audio")]
pub use device::DeviceSink;

#[cfg(feature = "device-audio")]
mod device {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use tokio_util::sync::CancellationToken;
    use tracing::error;

    use super::AudioSink;
    use crate::error::PlaybackError;
    use crate::types::AudioClip;
    use crate::wav;

    /// Plays clips on the default output device.
    #[derive(Debug, Clone)]
    pub struct DeviceSink {
        volume: f32,
    }

    impl DeviceSink {
        pub fn new(volume: f32) -> Self {
            Self {
                volume: volume.clamp(0.0, 1.0),
            }
        }
    }

    impl Default for DeviceSink {
        fn default() -> Self {
            Self::new(1.0)
        }
    }

    #[async_trait]
    impl AudioSink for DeviceSink {
        async fn play(&self, clip: AudioClip, stop: CancellationToken) -> Result<(), PlaybackError> {
            let (samples, sample_rate) = wav::decode_mono_f32(&clip.bytes)?;
            let volume = self.volume;
            tokio::task::spawn_blocking(move || play_blocking(samples, sample_rate, volume, stop))
                .await
                .map_err(|e| PlaybackError::Device(format!("playback thread failed: {e}")))?
        }
    }

    fn play_blocking(
        samples: Vec<f32>,
        sample_rate: u32,
        volume: f32,
        stop: CancellationToken,
    ) -> Result<(), PlaybackError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| PlaybackError::Device("no default output device".into()))?;
        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let total = samples.len();
        let samples = Arc::new(samples);
        let position = Arc::new(AtomicUsize::new(0));
        let stream_samples = Arc::clone(&samples);
        let stream_position = Arc::clone(&position);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        let i = stream_position.fetch_add(1, Ordering::Relaxed);
                        *sample = stream_samples.get(i).map_or(0.0, |s| s * volume);
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| PlaybackError::Device(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| PlaybackError::Device(format!("failed to start output stream: {e}")))?;

        while position.load(Ordering::Relaxed) < total && !stop.is_cancelled() {
            std::thread::sleep(Duration::from_millis(10));
        }

        drop(stream);
        Ok(())
    }
}

/// How the active clip ended.
#[derive(Debug)]
pub struct PlaybackOutcome {
    pub session_id: SessionId,
    pub unit_id: UnitId,
    pub result: Result<(), PlaybackError>,
}

struct ActivePlayback {
    session_id: SessionId,
    unit_id: UnitId,
    stop: CancellationToken,
    task: JoinHandle<Result<(), PlaybackError>>,
}

pub struct AudioPlayerController {
    sink: Arc<dyn AudioSink>,
    active: Option<ActivePlayback>,
}

impl AudioPlayerController {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self { sink, active: None }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Begin playing `item`. Anything still active is abandoned first.
    pub fn start(&mut self, item: PlayItem) {
        if let Some(previous) = self.active.take() {
            warn!(unit_id = previous.unit_id, "replacing an active clip");
            previous.stop.cancel();
            previous.task.abort();
        }

        let stop = CancellationToken::new();
        let sink = Arc::clone(&self.sink);
        let token = stop.clone();
        let clip = item.clip;
        let task = tokio::spawn(async move { sink.play(clip, token).await });

        debug!(session = %item.session_id, unit_id = item.unit_id, "clip started");
        self.active = Some(ActivePlayback {
            session_id: item.session_id,
            unit_id: item.unit_id,
            stop,
            task,
        });
    }

    /// Resolves when the active clip ends. Pending forever while idle.
    ///
    /// Cancel safe: dropping the future leaves the clip tracked.
    pub async fn finished(&mut self) -> PlaybackOutcome {
        let Some(active) = self.active.as_mut() else {
            return std::future::pending().await;
        };
        let joined = (&mut active.task).await;
        let (session_id, unit_id) = (active.session_id, active.unit_id);
        self.active = None;

        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(PlaybackError::Device(format!("playback task failed: {e}"))),
        };
        PlaybackOutcome {
            session_id,
            unit_id,
            result,
        }
    }

    /// Halt the active clip and wait for the sink to let go of the device.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.stop.cancel();
        if let Err(e) = active.task.await {
            if !e.is_cancelled() {
                warn!(unit_id = active.unit_id, "playback task failed while stopping: {e}");
            }
        }
        debug!(session = %active.session_id, unit_id = active.unit_id, "clip stopped");
    }
}
