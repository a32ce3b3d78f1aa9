//! ALSA implementation of the device layer.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O to avoid
//! contention with async network tasks. Each device thread opens its PCM,
//! reports the negotiated parameters back to the opener and then waits to be
//! activated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc;

use super::alsa_device::{self, NegotiatedParams};
use super::device::{DeviceProvider, InputDevice, OutputDevice, SourceHandle, SourceId};
use super::frame::AudioFrame;
use super::render_graph::{GraphSourceHandle, RenderGraph};
use crate::{Error, Result};

/// Audio device configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Rate requested from the capture device and sent on the wire
    pub input_sample_rate: u32,
    /// Rate of inbound audio, requested from the playback device
    pub output_sample_rate: u32,
    /// Desired capture channel count, mixed down to mono
    pub capture_channels: u32,
    /// Desired playback channel count, mono is duplicated across them
    pub playback_channels: u32,
    /// Frames per capture buffer handed to the pipeline
    pub capture_buffer_frames: usize,
    /// Desired ALSA playback period size (0 = let ALSA decide)
    pub playback_period_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            capture_channels: 1,
            playback_channels: 2,
            capture_buffer_frames: 4096,
            playback_period_size: 512,
        }
    }
}

pub struct AlsaBackend {
    config: AudioConfig,
    pitch_window: Duration,
}

impl AlsaBackend {
    pub fn new(config: AudioConfig, pitch_window: Duration) -> Self {
        Self {
            config,
            pitch_window,
        }
    }
}

impl DeviceProvider for AlsaBackend {
    fn open_input(&mut self, requested_rate: u32) -> Result<Box<dyn InputDevice>> {
        Ok(Box::new(AlsaInput::open(&self.config, requested_rate)?))
    }

    fn open_output(
        &mut self,
        requested_rate: u32,
        completions: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputDevice>> {
        Ok(Box::new(AlsaOutput::open(
            &self.config,
            requested_rate,
            self.pitch_window,
            completions,
        )?))
    }
}

// ======================== Capture ========================

pub struct AlsaInput {
    sample_rate: u32,
    start_tx: Option<std_mpsc::SyncSender<mpsc::Sender<AudioFrame>>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaInput {
    fn open(config: &AudioConfig, requested_rate: u32) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<anyhow::Result<NegotiatedParams>>(1);
        let (start_tx, start_rx) = std_mpsc::sync_channel::<mpsc::Sender<AudioFrame>>(1);

        let handle = {
            let running = running.clone();
            let device = config.capture_device.clone();
            let channels = config.capture_channels;
            let buffer_frames = config.capture_buffer_frames.max(1);
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    if let Err(e) = capture_thread(
                        &device,
                        requested_rate,
                        channels,
                        buffer_frames,
                        ready_tx,
                        start_rx,
                        &running,
                    ) {
                        log::error!("Capture thread error: {:#}", e);
                    }
                })?
        };

        let params = match ready_rx.recv() {
            Ok(Ok(params)) => params,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(Error::Device(format!("{:#}", e)));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::Device("capture thread exited during open".to_string()));
            }
        };

        Ok(Self {
            sample_rate: params.sample_rate,
            start_tx: Some(start_tx),
            running,
            handle: Some(handle),
        })
    }
}

impl InputDevice for AlsaInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<()> {
        let start_tx = self
            .start_tx
            .take()
            .ok_or_else(|| Error::Device("capture already started or stopped".to_string()))?;
        start_tx
            .send(frames)
            .map_err(|_| Error::Device("capture thread is gone".to_string()))
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Unblocks a thread still waiting to be started
        self.start_tx.take();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
            log::info!("Microphone released");
        }
    }
}

impl Drop for AlsaInput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    device: &str,
    requested_rate: u32,
    channels: u32,
    buffer_frames: usize,
    ready_tx: std_mpsc::SyncSender<anyhow::Result<NegotiatedParams>>,
    start_rx: std_mpsc::Receiver<mpsc::Sender<AudioFrame>>,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let (pcm, params) = match alsa_device::open_capture(device, requested_rate, channels) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return Ok(());
        }
    };
    let _ = ready_tx.send(Ok(params));

    // Hold the device until the session is open
    let frames_tx = match start_rx.recv() {
        Ok(tx) => tx,
        Err(_) => return Ok(()),
    };

    let ch = params.channels.max(1) as usize;
    let mut read_buf = vec![0i16; params.period_size.max(1) * ch];
    let mut accum: Vec<f32> = Vec::with_capacity(buffer_frames * 2);
    let io = pcm.io_i16()?;

    log::info!(
        "Capture started: rate={}, ch={}, period={}, buffer={}",
        params.sample_rate,
        ch,
        params.period_size,
        buffer_frames,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                // Interleaved i16 → mono f32
                for frame in read_buf[..frames * ch].chunks_exact(ch) {
                    let sum: f32 = frame.iter().map(|&s| s as f32 / 32768.0).sum();
                    accum.push(sum / ch as f32);
                }

                while accum.len() >= buffer_frames {
                    let samples: Vec<f32> = accum.drain(..buffer_frames).collect();
                    let frame = AudioFrame::mono(samples, params.sample_rate);
                    // Never block the device thread on a slow consumer
                    match frames_tx.try_send(frame) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            log::debug!("Capture queue full, dropping buffer");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            log::info!("Capture receiver dropped");
                            return Ok(());
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    log::info!("Capture stopped");
    Ok(())
}

// ======================== Playback ========================

pub struct AlsaOutput {
    sample_rate: u32,
    graph: Arc<Mutex<RenderGraph>>,
    active: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaOutput {
    fn open(
        config: &AudioConfig,
        requested_rate: u32,
        pitch_window: Duration,
        completions: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let active = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) =
            std_mpsc::sync_channel::<anyhow::Result<(NegotiatedParams, Arc<Mutex<RenderGraph>>)>>(1);

        let handle = {
            let running = running.clone();
            let active = active.clone();
            let device = config.playback_device.clone();
            let channels = config.playback_channels;
            let period = (config.playback_period_size > 0).then_some(config.playback_period_size);
            thread::Builder::new()
                .name("audio-render".into())
                .spawn(move || {
                    if let Err(e) = render_thread(
                        &device,
                        requested_rate,
                        channels,
                        period,
                        pitch_window,
                        ready_tx,
                        completions,
                        &active,
                        &running,
                    ) {
                        log::error!("Render thread error: {:#}", e);
                    }
                })?
        };

        let (params, graph) = match ready_rx.recv() {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(Error::Device(format!("{:#}", e)));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::Device("render thread exited during open".to_string()));
            }
        };

        Ok(Self {
            sample_rate: params.sample_rate,
            graph,
            active,
            running,
            handle: Some(handle),
        })
    }
}

impl OutputDevice for AlsaOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.graph.lock().map(|g| g.current_time()).unwrap_or(0.0)
    }

    fn resume(&mut self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::Device("output device is closed".to_string()));
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn schedule_buffer(
        &mut self,
        id: SourceId,
        frame: AudioFrame,
        start_time: f64,
        detune: f32,
    ) -> Result<Box<dyn SourceHandle>> {
        let mut graph = self
            .graph
            .lock()
            .map_err(|_| Error::Device("render graph lock poisoned".to_string()))?;
        graph.add_voice(id, frame, start_time, detune);
        Ok(Box::new(GraphSourceHandle::new(id, self.graph.clone())))
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
            log::info!("Output device closed");
        }
        if let Ok(mut graph) = self.graph.lock() {
            graph.clear();
        }
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[allow(clippy::too_many_arguments)]
fn render_thread(
    device: &str,
    requested_rate: u32,
    channels: u32,
    period_size: Option<usize>,
    pitch_window: Duration,
    ready_tx: std_mpsc::SyncSender<anyhow::Result<(NegotiatedParams, Arc<Mutex<RenderGraph>>)>>,
    completions: mpsc::UnboundedSender<SourceId>,
    active: &AtomicBool,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let (pcm, params) = match alsa_device::open_playback(device, requested_rate, channels, period_size) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return Ok(());
        }
    };
    let graph = Arc::new(Mutex::new(RenderGraph::new(params.sample_rate, pitch_window)));
    let _ = ready_tx.send(Ok((params, graph.clone())));

    let ch = params.channels.max(1) as usize;
    let period = params.period_size.max(1);
    let mut mono = vec![0.0f32; period];
    let mut pcm_buf = vec![0i16; period * ch];
    let io = pcm.io_i16()?;

    while running.load(Ordering::Relaxed) {
        // Suspended until the session activates the device
        if !active.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(5));
            continue;
        }

        let ended = match graph.lock() {
            Ok(mut g) => g.render(&mut mono),
            Err(_) => anyhow::bail!("render graph lock poisoned"),
        };
        for id in ended {
            let _ = completions.send(id);
        }

        // Mono → every device channel
        for (frame, &sample) in pcm_buf.chunks_exact_mut(ch).zip(&mono) {
            let value = (sample * 32767.0) as i16;
            frame.fill(value);
        }

        // Retry short writes; drop the rest of the period after repeated XRUNs
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < period {
            match io.writei(&pcm_buf[frames_written * ch..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        break;
                    }
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            period - frames_written
                        );
                        break;
                    }
                }
            }
        }
    }

    log::info!("Playback stopped");
    Ok(())
}
