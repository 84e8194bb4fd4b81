//! Input capture pipeline: microphone samples → fixed-size outbound frames.
//!
//! The device is opened at its native configuration; samples are downmixed,
//! resampled to the wire rate and cut into frames of `frame_samples`.

use crate::codec::{self, AudioFormat, AudioFrame, LinearResampler, OutboundFrame};
use crate::config::LiveConfig;
use crate::error::{LiveError, LiveResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SizedSample, Stream, StreamConfig};
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// What the capture thread hands to the session.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Frame(OutboundFrame),
    /// The input device failed after it was opened.
    DeviceError(String),
}

/// Cuts arbitrary device callback blocks into fixed-size wire frames.
#[derive(Debug)]
pub struct FrameAssembler {
    device_channels: u16,
    resampler: LinearResampler,
    format: AudioFormat,
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(device_channels: u16, device_rate: u32, format: AudioFormat, frame_samples: usize) -> Self {
        Self {
            device_channels,
            resampler: LinearResampler::new(device_rate, format.sample_rate),
            format,
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Feed one block of interleaved device samples; returns the frames it completed.
    pub fn push(&mut self, interleaved: &[f32]) -> Vec<OutboundFrame> {
        let mono = codec::downmix(interleaved, self.device_channels);
        self.resampler.process(&mono, &mut self.pending);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            let chunk = std::mem::replace(&mut self.pending, rest);
            frames.push(OutboundFrame::new(AudioFrame::from_f32(&chunk, self.format)));
        }
        frames
    }

    /// Samples waiting for a full frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Keeps the capture thread (and its cpal stream) alive. Drop to stop capturing.
pub struct CaptureHandle {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn stop(&mut self) {
        // Dropping the sender wakes the capture thread, which drops the stream.
        self.stop_tx.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
            info!("🛑 Audio capture stopped");
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Microphone capture using CPAL.
pub struct MicrophoneCapture;

impl MicrophoneCapture {
    /// Open the default input device and start producing frames on `tx`.
    ///
    /// The cpal `Stream` is not `Send` on every platform, so it is built and
    /// owned by a dedicated thread. Device errors during setup are returned
    /// here; later failures arrive as [`CaptureEvent::DeviceError`].
    pub fn start(config: &LiveConfig, tx: mpsc::UnboundedSender<CaptureEvent>) -> LiveResult<CaptureHandle> {
        let format = config.input_format();
        let frame_samples = config.frame_samples;
        let (ready_tx, ready_rx) = std_mpsc::channel::<LiveResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("pagi-live-capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(format, frame_samples, tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        let ready = ready_rx
            .recv()
            .map_err(|_| LiveError::AudioDevice("capture thread exited".to_string()))?;
        if let Err(e) = ready {
            let _ = thread.join();
            return Err(e);
        }

        info!("✅ Audio capture started");
        Ok(CaptureHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// List available input devices
    pub fn list_input_devices() -> LiveResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

fn open_input_stream(
    format: AudioFormat,
    frame_samples: usize,
    tx: mpsc::UnboundedSender<CaptureEvent>,
) -> LiveResult<Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| LiveError::AudioDevice("No input device available".to_string()))?;

    info!(
        "🎤 Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let supported = device.default_input_config()?;
    let stream_config: StreamConfig = supported.config();
    let assembler = FrameAssembler::new(
        stream_config.channels,
        stream_config.sample_rate.0,
        format,
        frame_samples,
    );

    info!(
        device_rate = stream_config.sample_rate.0,
        device_channels = stream_config.channels,
        wire_rate = format.sample_rate,
        frame_samples,
        "capture configured"
    );

    match supported.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, assembler, tx),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, assembler, tx),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, assembler, tx),
        other => Err(LiveError::AudioDevice(format!(
            "unsupported input sample format: {:?}",
            other
        ))),
    }
}

fn build_stream<T>(
    device: &Device,
    stream_config: &StreamConfig,
    mut assembler: FrameAssembler,
    tx: mpsc::UnboundedSender<CaptureEvent>,
) -> LiveResult<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let err_tx = tx.clone();
    let mut block: Vec<f32> = Vec::new();

    let stream = device.build_input_stream(
        stream_config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            block.clear();
            block.extend(data.iter().map(|&s| s.to_sample::<f32>()));
            for frame in assembler.push(&block) {
                if tx.send(CaptureEvent::Frame(frame)).is_err() {
                    // Session gone; the handle will stop us shortly.
                    return;
                }
            }
        },
        move |err| {
            error!("Audio input stream error: {}", err);
            if err_tx.send(CaptureEvent::DeviceError(err.to_string())).is_err() {
                warn!("Capture error dropped: session receiver closed");
            }
        },
        None,
    )?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_emits_fixed_size_frames() {
        let mut assembler = FrameAssembler::new(1, 16000, AudioFormat::mono(16000), 480);
        assert!(assembler.push(&[0.1; 300]).is_empty());
        assert_eq!(assembler.pending(), 300);

        let frames = assembler.push(&[0.1; 700]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 480));
        assert_eq!(assembler.pending(), 40);
    }

    #[test]
    fn test_assembler_downmixes_and_resamples() {
        // 10ms of 48kHz stereo becomes 160 mono samples at 16kHz
        let mut assembler = FrameAssembler::new(2, 48000, AudioFormat::mono(16000), 160);
        let frames = assembler.push(&[0.25; 960]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].format(), AudioFormat::mono(16000));
        assert_eq!(frames[0].samples()[0], codec::f32_to_i16(0.25));
    }

    #[test]
    fn test_assembler_frame_rate_holds_over_many_blocks() {
        // One second of 48kHz mono in 512-sample callbacks
        let mut assembler = FrameAssembler::new(1, 48000, AudioFormat::mono(16000), 480);
        let block = [0.1f32; 512];
        let mut frames = 0;
        for _ in 0..94 {
            frames += assembler.push(&block).len();
        }
        let produced = frames * 480 + assembler.pending();
        let expected = 94 * 512 / 3;
        assert!((produced as i64 - expected as i64).abs() <= 1);
        assert_eq!(frames, expected / 480);
    }

    #[test]
    fn test_list_devices() {
        // This might fail in CI environments without audio devices
        if let Ok(devices) = MicrophoneCapture::list_input_devices() {
            println!("Available input devices: {:?}", devices);
        }
    }
}
