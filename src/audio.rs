//! Microphone capture and remote playback over cpal, carried as G.711 µ-law.
//!
//! cpal streams are not `Send`, so each one lives on its own thread and is
//! stopped by closing a channel.

use crate::error::MediaError;
use crate::media::{CaptureHandle, CapturedStream, LocalStream, LocalTrack, MediaDevice};
use crate::rtc::pcmu_capability;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Sample as _;
use cpal::{BuildStreamError, FromSample, SampleFormat, SizedSample};
use std::collections::VecDeque;
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle as TaskHandle;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

pub const PCMU_RATE: u32 = 8000;
const FRAME_SAMPLES: usize = 160;
const FRAME_DURATION: Duration = Duration::from_millis(20);
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;
/// One second of buffered playback before old audio is dropped.
const MAX_BUFFERED: usize = PCMU_RATE as usize;

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let value = !byte as i32;
    let exponent = (value >> 4) & 0x07;
    let mantissa = value & 0x0F;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if value & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Averages device-rate mono samples down to 8 kHz and cuts 20 ms frames.
///
/// The phase counts in units of `1 / device_rate` so rates that are not a
/// multiple of 8 kHz (44.1 kHz) still yield exactly 8000 samples a second.
pub struct PcmuPacketizer {
    device_rate: u32,
    phase: u32,
    acc: f32,
    acc_len: usize,
    frame: Vec<u8>,
}

impl PcmuPacketizer {
    pub fn new(device_rate: u32) -> Self {
        Self {
            device_rate: device_rate.max(1),
            phase: 0,
            acc: 0.0,
            acc_len: 0,
            frame: Vec::with_capacity(FRAME_SAMPLES),
        }
    }

    pub fn push(&mut self, sample: f32) -> Option<Bytes> {
        self.acc += sample;
        self.acc_len += 1;
        self.phase += PCMU_RATE;
        if self.phase < self.device_rate {
            return None;
        }
        self.phase -= self.device_rate;

        let mean = (self.acc / self.acc_len as f32).clamp(-1.0, 1.0);
        self.acc = 0.0;
        self.acc_len = 0;
        self.frame.push(linear_to_ulaw((mean * i16::MAX as f32) as i16));

        if self.frame.len() < FRAME_SAMPLES {
            return None;
        }
        Some(Bytes::from(std::mem::replace(
            &mut self.frame,
            Vec::with_capacity(FRAME_SAMPLES),
        )))
    }
}

/// Stretches 8 kHz audio to the device rate by holding each sample for the
/// device frames it covers.
pub struct SampleHold {
    device_rate: u32,
    phase: u32,
}

impl SampleHold {
    pub fn new(device_rate: u32) -> Self {
        let device_rate = device_rate.max(1);
        Self {
            device_rate,
            phase: device_rate,
        }
    }

    /// Called once per device frame; true when the next 8 kHz sample is due.
    pub fn advance(&mut self) -> bool {
        let due = self.phase >= self.device_rate;
        if due {
            self.phase -= self.device_rate;
        }
        self.phase += PCMU_RATE;
        due
    }
}

/// The default input device, captured on a dedicated thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

#[async_trait]
impl MediaDevice for CpalMicrophone {
    async fn open_microphone(&self) -> std::result::Result<CapturedStream, MediaError> {
        let stream_id = format!("local-{:08x}", rand::random::<u32>());
        let track = Arc::new(TrackLocalStaticSample::new(
            pcmu_capability(),
            "audio".to_owned(),
            stream_id.clone(),
        ));

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let capture_track = track.clone();
        let thread = std::thread::Builder::new()
            .name("mic-capture".to_owned())
            .spawn(move || run_capture(capture_track, ready_tx, stop_rx))
            .map_err(|e| MediaError::Unavailable(e.to_string()))?;

        let ready = ready_rx
            .await
            .unwrap_or_else(|_| Err(MediaError::Unavailable("capture thread exited".to_owned())));
        let mut handle = DeviceThread {
            stop: Some(stop_tx),
            thread: Some(thread),
        };
        if let Err(e) = ready {
            handle.stop();
            return Err(e);
        }

        Ok(CapturedStream {
            stream: LocalStream::new(stream_id, vec![LocalTrack::new("audio", track)]),
            handle: Box::new(handle),
        })
    }
}

struct DeviceThread {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle for DeviceThread {
    fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

fn run_capture(
    track: Arc<TrackLocalStaticSample>,
    ready: oneshot::Sender<std::result::Result<(), MediaError>>,
    stop: std_mpsc::Receiver<()>,
) {
    let stream = match open_input(track) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(MediaError::AccessDenied(e.to_string())));
        return;
    }
    let _ = ready.send(Ok(()));

    // Blocks until the handle is stopped or dropped.
    let _ = stop.recv();
    drop(stream);
    log::debug!("Microphone capture stopped");
}

fn open_input(track: Arc<TrackLocalStaticSample>) -> std::result::Result<cpal::Stream, MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| MediaError::Unavailable("no input device available".to_owned()))?;
    let config = device
        .default_input_config()
        .map_err(|e| MediaError::Unavailable(e.to_string()))?;
    log::info!("Input config: {:?}", config);

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config.into(), track),
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config.into(), track),
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config.into(), track),
        sample_format => {
            return Err(MediaError::Unavailable(format!(
                "unsupported sample format: {:?}",
                sample_format
            )))
        }
    };
    stream.map_err(|e| match e {
        BuildStreamError::DeviceNotAvailable => MediaError::Unavailable(e.to_string()),
        other => MediaError::AccessDenied(other.to_string()),
    })
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    track: Arc<TrackLocalStaticSample>,
) -> std::result::Result<cpal::Stream, BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut packetizer = PcmuPacketizer::new(config.sample_rate.0);
    let err_fn = |err| log::error!("An error occurred on the input audio stream: {}", err);

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                let Some(first) = frame.first() else {
                    continue;
                };
                if let Some(payload) = packetizer.push(f32::from_sample(*first)) {
                    let sample = Sample {
                        data: payload,
                        duration: FRAME_DURATION,
                        ..Default::default()
                    };
                    if let Err(e) = futures::executor::block_on(track.write_sample(&sample)) {
                        log::warn!("Failed to write audio sample: {}", e);
                    }
                }
            }
        },
        err_fn,
        None,
    )
}

/// Plays one remote track on the default output device until dropped.
pub struct AudioPlayback {
    reader: TaskHandle<()>,
    output: DeviceThread,
}

impl AudioPlayback {
    pub async fn start(track: Arc<TrackRemote>) -> Result<Self> {
        let buffer = Arc::new(Mutex::new(VecDeque::<f32>::new()));

        let sink = buffer.clone();
        let reader = tokio::spawn(async move {
            while let Ok((packet, _)) = track.read_rtp().await {
                let Ok(mut queue) = sink.lock() else {
                    break;
                };
                queue.extend(
                    packet
                        .payload
                        .iter()
                        .map(|b| ulaw_to_linear(*b) as f32 / i16::MAX as f32),
                );
                let excess = queue.len().saturating_sub(MAX_BUFFERED);
                queue.drain(..excess);
            }
        });

        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("playback".to_owned())
            .spawn(move || {
                let stream = match open_output(buffer) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        let mut output = DeviceThread {
            stop: Some(stop_tx),
            thread: Some(thread),
        };
        match ready_rx.await {
            Ok(Ok(())) => Ok(Self { reader, output }),
            Ok(Err(e)) => {
                reader.abort();
                output.stop();
                Err(e)
            }
            Err(_) => {
                reader.abort();
                output.stop();
                Err(anyhow::anyhow!("playback thread exited"))
            }
        }
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.reader.abort();
        self.output.stop();
    }
}

fn open_output(buffer: Arc<Mutex<VecDeque<f32>>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow::anyhow!("No output device available"))?;
    let config = device.default_output_config()?;
    log::info!("Output config: {:?}", config);

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_output_stream::<f32>(&device, &config.into(), buffer)?,
        SampleFormat::I16 => build_output_stream::<i16>(&device, &config.into(), buffer)?,
        SampleFormat::U16 => build_output_stream::<u16>(&device, &config.into(), buffer)?,
        sample_format => {
            return Err(anyhow::anyhow!(
                "Unsupported sample format: {:?}",
                sample_format
            ))
        }
    };
    stream.play()?;
    Ok(stream)
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    buffer: Arc<Mutex<VecDeque<f32>>>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut hold = SampleHold::new(config.sample_rate.0);
    let mut current = 0.0f32;
    let err_fn = |err| log::error!("An error occurred on the output audio stream: {}", err);

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut queue = buffer.lock().ok();
            for frame in data.chunks_mut(channels) {
                if hold.advance() {
                    // Output silence if no samples available
                    current = queue
                        .as_mut()
                        .and_then(|q| q.pop_front())
                        .unwrap_or(0.0);
                }
                for sample in frame.iter_mut() {
                    *sample = T::from_sample(current);
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulaw_keeps_silence_and_sign() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(ulaw_to_linear(0xFF), 0);
        assert!(ulaw_to_linear(linear_to_ulaw(-1000)) < 0);
        assert!(ulaw_to_linear(linear_to_ulaw(1000)) > 0);
    }

    #[test]
    fn ulaw_error_stays_within_one_segment_step() {
        for value in [100i16, 1000, 8000, 32000, -2500, i16::MIN + 1] {
            let decoded = ulaw_to_linear(linear_to_ulaw(value)) as i32;
            let error = (decoded - value as i32).abs();
            assert!(
                error <= (value as i32).abs() / 16 + 8,
                "{} decoded as {}",
                value,
                decoded
            );
        }
    }

    #[test]
    fn packetizer_yields_fifty_frames_a_second_at_44_1k() {
        let mut packetizer = PcmuPacketizer::new(44_100);
        let frames = (0..44_100).filter_map(|_| packetizer.push(0.25)).count();
        assert_eq!(frames, 50);
    }

    #[test]
    fn sample_hold_consumes_8k_samples_a_second() {
        for rate in [44_100, 48_000, 16_000, 8_000] {
            let mut hold = SampleHold::new(rate);
            let due = (0..rate).filter(|_| hold.advance()).count();
            assert_eq!(due, PCMU_RATE as usize, "at {} Hz", rate);
        }
    }

    #[test]
    fn packetizer_cuts_twenty_millisecond_frames_at_48k() {
        let mut packetizer = PcmuPacketizer::new(48_000);
        let frames: Vec<Bytes> = (0..960 * 2).filter_map(|_| packetizer.push(0.0)).collect();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == FRAME_SAMPLES));
        assert!(frames[0].iter().all(|b| *b == 0xFF));
    }
}
