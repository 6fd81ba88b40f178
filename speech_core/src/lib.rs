//! Speech side of the assistant pipeline.
//!
//! Turns streamed response text into speakable units, normalizes them,
//! synthesizes them concurrently and plays the audio strictly in order.
pub mod error;
pub mod normalize;
pub mod playback;
pub mod player;
pub mod queue;
pub mod segmenter;
pub mod synth;
pub mod types;
pub mod voice;
pub mod wav;

pub use error::{PlaybackError, SynthesisError};
pub use normalize::{remove_citations, Normalizer};
pub use playback::{PlaybackEvent, PlaybackHandle};
pub use player::{AudioPlayerController, AudioSink, ClockSink};
#[cfg(feature = "device-audio")]
pub use player::DeviceSink;
pub use queue::{OrderedAudioQueue, PlayItem};
pub use segmenter::{SegmenterConfig, SentenceSegmenter};
pub use synth::{
    OpenAiSpeechConfig, OpenAiSynthesizer, SynthesisClient, SynthesisConfig, Synthesizer,
};
pub use types::{
    AudioClip, SessionId, SpeakableUnit, SynthesisResult, SynthesizeRequest, UnitId,
    FIRST_UNIT_ID,
};
pub use voice::{UnknownVoice, Voice};
