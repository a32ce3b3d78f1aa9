//! Shared test utilities: scripted devices and a loopback transport

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use voxduplex::audio::device::{DeviceProvider, InputDevice, OutputDevice, SourceHandle, SourceId};
use voxduplex::audio::{pcm_codec, resample, AudioConfig, AudioFrame};
use voxduplex::config::{Config, PlaybackConfig};
use voxduplex::controller::SessionController;
use voxduplex::net_link::{FailureCause, NetCommand, NetEvent, SessionRequest, SessionSender, Transport};
use voxduplex::protocol::Blob;
use voxduplex::volume::VolumeObserver;
use voxduplex::{Error, Result};

/// Build a config pointing at nothing real
#[must_use]
pub fn test_config(api_key: Option<&str>) -> Config {
    Config {
        ws_url: "wss://loopback.invalid/live".to_string(),
        model: "models/test".to_string(),
        voice: "Puck".to_string(),
        api_key_env: "VOXDUPLEX_TEST_KEY".to_string(),
        api_key: api_key.map(str::to_string),
        audio: AudioConfig::default(),
        playback: PlaybackConfig::default(),
    }
}

/// Observer that records every report
pub fn recording_observer() -> (VolumeObserver, Arc<Mutex<Vec<(f32, f32)>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    let observer: VolumeObserver = Arc::new(move |input, output| {
        sink.lock().unwrap().push((input, output));
    });
    (observer, calls)
}

/// Build a controller on top of fake devices and a loopback transport
pub fn controller(
    api_key: Option<&str>,
    rig: &Rig,
    link: &Loopback,
) -> (SessionController, Arc<Mutex<Vec<(f32, f32)>>>) {
    let (observer, calls) = recording_observer();
    let controller = SessionController::new(
        test_config(api_key),
        Box::new(rig.clone()),
        Arc::new(link.clone()),
        observer,
    );
    (controller, calls)
}

/// Handle one controller event, failing the test if none arrives in time
pub async fn step(controller: &mut SessionController) {
    let handled = tokio::time::timeout(Duration::from_secs(2), controller.process_next())
        .await
        .expect("controller stalled");
    assert!(handled, "no live session to process");
}

// ======================== Devices ========================

#[derive(Default)]
pub struct RigState {
    pub clock: f64,
    pub fail_input: bool,
    pub fail_output: bool,
    pub fail_resume: bool,
    /// Rate granted to the input device regardless of the request
    pub input_rate: Option<u32>,

    pub inputs_opened: usize,
    pub outputs_opened: usize,
    pub input_started: bool,
    pub input_stopped: bool,
    pub output_closed: bool,
    pub capture_tx: Option<mpsc::Sender<AudioFrame>>,
    pub completions: Option<mpsc::UnboundedSender<SourceId>>,

    pub scheduled: Vec<(SourceId, AudioFrame, f64, f32)>,
    pub playing: Vec<SourceId>,
    pub ramps: Vec<(SourceId, f32, Duration)>,
}

/// Scripted device provider; clones share state
#[derive(Clone, Default)]
pub struct Rig(pub Arc<Mutex<RigState>>);

impl Rig {
    pub fn state(&self) -> std::sync::MutexGuard<'_, RigState> {
        self.0.lock().unwrap()
    }

    pub fn set_clock(&self, seconds: f64) {
        self.state().clock = seconds;
    }

    /// Deliver one microphone buffer as the capture thread would
    pub fn capture(&self, frame: AudioFrame) {
        let tx = self.state().capture_tx.clone().expect("capture not started");
        tx.try_send(frame).expect("capture queue full");
    }

    /// Report a source as finished on the device
    pub fn finish(&self, id: SourceId) {
        let mut state = self.state();
        state.playing.retain(|&p| p != id);
        if let Some(tx) = &state.completions {
            let _ = tx.send(id);
        }
    }
}

impl DeviceProvider for Rig {
    fn open_input(&mut self, requested_rate: u32) -> Result<Box<dyn InputDevice>> {
        let mut state = self.state();
        if state.fail_input {
            return Err(Error::Device("microphone permission denied".to_string()));
        }
        state.inputs_opened += 1;
        let rate = state.input_rate.unwrap_or(requested_rate);
        Ok(Box::new(FakeInput {
            rig: self.clone(),
            rate,
        }))
    }

    fn open_output(
        &mut self,
        requested_rate: u32,
        completions: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputDevice>> {
        let mut state = self.state();
        if state.fail_output {
            return Err(Error::Device("no playback device".to_string()));
        }
        state.outputs_opened += 1;
        state.completions = Some(completions);
        Ok(Box::new(FakeOutput {
            rig: self.clone(),
            rate: requested_rate,
        }))
    }
}

struct FakeInput {
    rig: Rig,
    rate: u32,
}

impl InputDevice for FakeInput {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<()> {
        let mut state = self.rig.state();
        state.input_started = true;
        state.capture_tx = Some(frames);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.rig.state();
        state.input_stopped = true;
        state.capture_tx = None;
    }
}

struct FakeOutput {
    rig: Rig,
    rate: u32,
}

impl OutputDevice for FakeOutput {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn current_time(&self) -> f64 {
        self.rig.state().clock
    }

    fn resume(&mut self) -> Result<()> {
        if self.rig.state().fail_resume {
            return Err(Error::Device("output refused to start".to_string()));
        }
        Ok(())
    }

    fn schedule_buffer(
        &mut self,
        id: SourceId,
        frame: AudioFrame,
        start_time: f64,
        detune: f32,
    ) -> Result<Box<dyn SourceHandle>> {
        let mut state = self.rig.state();
        state.scheduled.push((id, frame, start_time, detune));
        state.playing.push(id);
        Ok(Box::new(FakeSource {
            rig: self.rig.clone(),
            id,
        }))
    }

    fn close(&mut self) {
        let mut state = self.rig.state();
        state.output_closed = true;
        state.completions = None;
    }
}

struct FakeSource {
    rig: Rig,
    id: SourceId,
}

impl SourceHandle for FakeSource {
    fn stop(&mut self) {
        self.rig.state().playing.retain(|&p| p != self.id);
    }

    fn ramp_detune(&mut self, cents: f32, ramp: Duration) -> Result<()> {
        let mut state = self.rig.state();
        if !state.playing.contains(&self.id) {
            return Err(Error::Device("source already stopped".to_string()));
        }
        state.ramps.push((self.id, cents, ramp));
        Ok(())
    }
}

// ======================== Transport ========================

/// What the loopback does once a session opens
#[derive(Clone, Debug, Default)]
pub enum Behavior {
    /// Signal open, then echo every frame back at 24 kHz
    #[default]
    Echo,
    /// Never signal open
    Silent,
    /// Fail right after the handshake
    Fail(FailureCause),
    /// Refuse to open at all
    Refuse,
}

#[derive(Default)]
pub struct LinkState {
    pub behavior: Behavior,
    pub opened: usize,
    pub requests: Vec<SessionRequest>,
    pub sent: Vec<voxduplex::audio::EncodedFrame>,
    pub closed: bool,
    /// Event channel of the most recent session, for injecting server events
    pub events: Option<mpsc::Sender<NetEvent>>,
}

/// In-process stand-in for the realtime service; clones share state
#[derive(Clone, Default)]
pub struct Loopback(pub Arc<Mutex<LinkState>>);

impl Loopback {
    pub fn with(behavior: Behavior) -> Self {
        let link = Self::default();
        link.state().behavior = behavior;
        link
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.0.lock().unwrap()
    }

    /// Push a server event into the current session
    pub async fn inject(&self, event: NetEvent) {
        let tx = self.state().events.clone().expect("no session open");
        tx.send(event).await.expect("controller dropped the session");
    }
}

/// Encode `samples` as an inbound chunk at `rate`
pub fn audio_chunk(samples: &[f32], rate: u32) -> Blob {
    Blob {
        mime_type: pcm_codec::mime_type(rate),
        data: pcm_codec::to_base64(&pcm_codec::encode(samples, rate)),
    }
}

#[async_trait]
impl Transport for Loopback {
    async fn open(
        &self,
        request: SessionRequest,
        events: mpsc::Sender<NetEvent>,
    ) -> Result<SessionSender> {
        let behavior = {
            let mut state = self.state();
            if matches!(state.behavior, Behavior::Refuse) {
                return Err(Error::Transport("connection refused".to_string()));
            }
            state.opened += 1;
            state.requests.push(request);
            state.events = Some(events.clone());
            state.closed = false;
            state.behavior.clone()
        };

        let (tx_cmd, mut rx_cmd) = mpsc::channel::<NetCommand>(64);
        let link = self.clone();
        tokio::spawn(async move {
            match &behavior {
                Behavior::Echo => {
                    let _ = events.send(NetEvent::Opened).await;
                }
                Behavior::Fail(cause) => {
                    let _ = events.send(NetEvent::Failed(cause.clone())).await;
                }
                Behavior::Silent | Behavior::Refuse => {}
            }

            while let Some(cmd) = rx_cmd.recv().await {
                match cmd {
                    NetCommand::SendAudio(frame) => {
                        link.state().sent.push(frame.clone());
                        if matches!(behavior, Behavior::Echo) {
                            let decoded = pcm_codec::decode(&frame.data, frame.sample_rate, 1);
                            let echoed = resample(decoded.channel(0), frame.sample_rate, 24000);
                            let _ = events.send(NetEvent::Audio(audio_chunk(&echoed, 24000))).await;
                        }
                    }
                    NetCommand::Close => break,
                }
            }
            link.state().closed = true;
        });

        Ok(SessionSender::new(tx_cmd))
    }
}
