//! Audio codec: PCM16 little-endian mono on the wire, f32 at the devices.
//!
//! Microphone samples are quantised to i16 once, when an [`OutboundFrame`] is
//! built; inbound chunks are decoded into an [`InboundFrame`] that the
//! playback scheduler converts back to f32.

use crate::error::{LiveError, LiveResult};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

/// Sample rate and channel count of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// MIME type advertised for realtime input chunks.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Parse `audio/pcm;rate=24000`. Missing rate falls back to `default_rate`.
    pub fn from_mime(mime: &str, default_rate: u32) -> LiveResult<Self> {
        let mut parts = mime.split(';').map(str::trim);
        let base = parts.next().unwrap_or_default();
        if !base.eq_ignore_ascii_case("audio/pcm") && !base.eq_ignore_ascii_case("audio/l16") {
            return Err(LiveError::Protocol(format!("unsupported audio mime type: {}", mime)));
        }
        let rate = parts
            .find_map(|p| p.strip_prefix("rate="))
            .map(|r| {
                r.parse::<u32>()
                    .map_err(|_| LiveError::Protocol(format!("bad sample rate in {}", mime)))
            })
            .transpose()?
            .unwrap_or(default_rate);
        if rate == 0 {
            return Err(LiveError::Protocol(format!("zero sample rate in {}", mime)));
        }
        Ok(Self::mono(rate))
    }
}

/// Immutable chunk of PCM samples plus its format.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    format: AudioFormat,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, format: AudioFormat) -> Self {
        Self {
            samples: samples.into(),
            format,
        }
    }

    /// Quantise normalised f32 samples (-1.0..=1.0).
    pub fn from_f32(samples: &[f32], format: AudioFormat) -> Self {
        Self::new(samples.iter().map(|&s| f32_to_i16(s)).collect(), format)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        let per_channel = self.samples.len() as u64 / self.format.channels.max(1) as u64;
        Duration::from_nanos(per_channel * 1_000_000_000 / self.format.sample_rate.max(1) as u64)
    }

    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| i16_to_f32(s)).collect()
    }
}

/// Microphone frame headed for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame(AudioFrame);

/// Synthesized agent audio received from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame(AudioFrame);

impl OutboundFrame {
    pub fn new(frame: AudioFrame) -> Self {
        Self(frame)
    }
}

impl InboundFrame {
    pub fn new(frame: AudioFrame) -> Self {
        Self(frame)
    }
}

impl Deref for OutboundFrame {
    type Target = AudioFrame;
    fn deref(&self) -> &AudioFrame {
        &self.0
    }
}

impl Deref for InboundFrame {
    type Target = AudioFrame;
    fn deref(&self) -> &AudioFrame {
        &self.0
    }
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Raw PCM16 LE bytes of a frame.
pub fn encode(frame: &OutboundFrame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frame.len() * 2);
    for &s in frame.samples() {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    buf
}

/// Base64 payload for a `realtimeInput` media chunk.
pub fn encode_base64(frame: &OutboundFrame) -> String {
    B64.encode(encode(frame))
}

/// Decode PCM16 LE bytes received from the agent.
pub fn decode(bytes: &[u8], format: AudioFormat) -> LiveResult<InboundFrame> {
    if bytes.len() % 2 != 0 {
        return Err(LiveError::Protocol(format!(
            "PCM16 chunk has odd length {}",
            bytes.len()
        )));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(InboundFrame::new(AudioFrame::new(samples, format)))
}

pub fn decode_base64(data: &str) -> LiveResult<Vec<u8>> {
    B64.decode(data)
        .map_err(|e| LiveError::Protocol(format!("invalid base64 audio: {}", e)))
}

/// Average interleaved channels down to mono.
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let n = channels as usize;
    interleaved
        .chunks_exact(n)
        .map(|c| c.iter().sum::<f32>() / n as f32)
        .collect()
}

/// Streaming linear-interpolation resampler for mono f32.
///
/// Device callbacks deliver audio in arbitrary blocks; the read position and
/// the last input sample carry over from one block to the next, so the output
/// rate is exact over time and there is no seam at block boundaries.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    step: f64,
    /// Read position relative to the start of the next block. Negative values
    /// fall between `prev` and the block's first sample.
    pos: f64,
    prev: Option<f32>,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let step = if from_rate == 0 || to_rate == 0 {
            1.0
        } else {
            from_rate as f64 / to_rate as f64
        };
        Self {
            step,
            pos: 0.0,
            prev: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    /// Resample one block, appending to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.is_passthrough() {
            out.extend_from_slice(input);
            return;
        }
        let Some(&last) = input.last() else {
            return;
        };
        let n = input.len() as f64;
        let sample = |i: isize| -> f32 {
            if i < 0 {
                self.prev.unwrap_or(input[0])
            } else {
                input[i as usize]
            }
        };

        // Interpolating at `pos` needs the sample after floor(pos).
        while self.pos.floor() + 1.0 <= n - 1.0 {
            let idx = self.pos.floor();
            let frac = (self.pos - idx) as f32;
            let a = sample(idx as isize);
            let b = sample(idx as isize + 1);
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }

        self.pos -= n;
        self.prev = Some(last);
    }
}
