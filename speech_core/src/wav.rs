//! WAV helpers for synthesized clips.
//!
//! The synthesis service is asked for `wav` output so clips can be inspected and
//! decoded with `hound`. Streamed responses often carry a placeholder data
//! length in the header, so durations are clamped to the bytes actually
//! present.
use std::io::Cursor;
use std::time::Duration;

use crate::error::PlaybackError;

const WAV_HEADER_LEN: usize = 44;

/// Header facts about a clip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: u64,
    pub duration: Duration,
}

/// Read the header and work out how long the clip plays.
pub fn inspect(bytes: &[u8]) -> Result<ClipInfo, PlaybackError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 || spec.channels == 0 {
        return Err(PlaybackError::Decode("zero sample rate or channel count".into()));
    }

    let frame_bytes = spec.channels as u64 * (spec.bits_per_sample as u64).div_ceil(8);
    let available = bytes.len().saturating_sub(WAV_HEADER_LEN) as u64 / frame_bytes.max(1);
    let frames = (reader.duration() as u64).min(available);
    let duration = Duration::from_secs_f64(frames as f64 / spec.sample_rate as f64);

    Ok(ClipInfo {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        frames,
        duration,
    })
}

/// Decode to mono f32 in [-1.0, 1.0], averaging channels.
pub fn decode_mono_f32(bytes: &[u8]) -> Result<(Vec<f32>, u32), PlaybackError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    // A truncated tail ends the clip rather than failing it.
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map_while(Result::ok)
            .collect(),
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map_while(Result::ok)
                .map(|s| s as f32 / scale)
                .collect()
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Encode PCM f32 samples as 16-bit mono WAV.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::<u8>::with_capacity(WAV_HEADER_LEN + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| anyhow::anyhow!("wav write err: {e}"))?;
        const I16_MAX_F32: f32 = i16::MAX as f32;
        for &s in samples {
            writer
                .write_sample((s.clamp(-1.0, 1.0) * I16_MAX_F32) as i16)
                .map_err(|e| anyhow::anyhow!("wav sample err: {e}"))?;
        }
        writer
            .finalize()
            .map_err(|e| anyhow::anyhow!("wav finalize err: {e}"))?;
    }
    Ok(cursor.into_inner())
}

/// A silent clip of the given length, handy as a placeholder or in tests.
pub fn silence(duration: Duration, sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let frames = (duration.as_secs_f64() * sample_rate as f64).round() as usize;
    encode_wav(&vec![0.0; frames], sample_rate)
}
