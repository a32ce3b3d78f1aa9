//! Session controller: the task that owns a session's devices, scheduler and
//! transport, and serializes every event touching them.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::audio::device::{DeviceProvider, InputDevice, SourceId};
use crate::audio::frame::AudioFrame;
use crate::audio::level_meter::rms;
use crate::audio::pcm_codec;
use crate::audio::{CapturePipeline, PlaybackScheduler};
use crate::config::Config;
use crate::net_link::{FailureCause, NetEvent, SessionRequest, SessionSender, Transport};
use crate::protocol::Blob;
use crate::state_machine::{SessionState, Transition};
use crate::volume::VolumeObserver;
use crate::{Error, Result};

/// Published on every state change.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Set only when `state` is `Error`
    pub error: Option<String>,
}

/// Requests from the front-end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    Connect,
    Disconnect,
    SetPitch(f32),
    Shutdown,
}

/// Everything that can reach the controller while a session is live.
#[derive(Debug)]
pub enum ControllerEvent {
    Capture(AudioFrame),
    Net(NetEvent),
    SourceEnded(SourceId),
}

enum Step<T> {
    Ready(T),
    Drained,
}

enum Polled {
    Net(Step<NetEvent>),
    Capture(Step<AudioFrame>),
    Ended(Step<SourceId>),
}

async fn recv_bounded<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Step<T> {
    match rx {
        Some(rx) => rx.recv().await.map_or(Step::Drained, Step::Ready),
        None => std::future::pending().await,
    }
}

async fn recv_unbounded<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Step<T> {
    match rx {
        Some(rx) => rx.recv().await.map_or(Step::Drained, Step::Ready),
        None => std::future::pending().await,
    }
}

pub struct SessionController {
    config: Config,
    devices: Box<dyn DeviceProvider>,
    transport: Arc<dyn Transport>,
    observer: VolumeObserver,
    status: watch::Sender<SessionStatus>,
    state: SessionState,
    pitch_cents: f32,

    // 会话资源，teardown 时全部释放
    session_id: Option<Uuid>,
    input: Option<Box<dyn InputDevice>>,
    scheduler: Option<PlaybackScheduler>,
    capture: Option<CapturePipeline>,
    outbound: Option<SessionSender>,
    net_rx: Option<mpsc::Receiver<NetEvent>>,
    capture_rx: Option<mpsc::Receiver<AudioFrame>>,
    ended_rx: Option<mpsc::UnboundedReceiver<SourceId>>,
}

impl SessionController {
    pub fn new(
        config: Config,
        devices: Box<dyn DeviceProvider>,
        transport: Arc<dyn Transport>,
        observer: VolumeObserver,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            state: SessionState::Disconnected,
            error: None,
        });
        Self {
            config,
            devices,
            transport,
            observer,
            status,
            state: SessionState::Disconnected,
            pitch_cents: 0.0,
            session_id: None,
            input: None,
            scheduler: None,
            capture: None,
            outbound: None,
            net_rx: None,
            capture_rx: None,
            ended_rx: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn pitch(&self) -> f32 {
        self.pitch_cents
    }

    pub fn playback(&self) -> Option<&PlaybackScheduler> {
        self.scheduler.as_ref()
    }

    /// Whether any session resource is still held.
    pub fn holds_resources(&self) -> bool {
        self.input.is_some()
            || self.scheduler.is_some()
            || self.capture.is_some()
            || self.outbound.is_some()
            || self.net_rx.is_some()
            || self.capture_rx.is_some()
            || self.ended_rx.is_some()
    }

    /// Open devices and the remote session.
    ///
    /// Ignored while a session is already connecting or connected. Any
    /// failure releases what was acquired and leaves the controller in
    /// `Error` with one message published.
    pub async fn connect(&mut self) {
        if self.state.is_active() {
            log::debug!("Connect ignored, session is {}", self.state);
            return;
        }
        self.transition(Transition::Connect, None);

        let Some(api_key) = self.config.api_key.clone() else {
            let missing = Error::MissingCredential(self.config.api_key_env.clone());
            self.fail(setup_failure(&missing));
            return;
        };

        let id = Uuid::new_v4();
        self.session_id = Some(id);
        log::info!("Session {}: connecting", id);

        if let Err(e) = self.acquire(id, api_key).await {
            log::error!("Session {}: setup failed: {}", id, e);
            self.fail(setup_failure(&e));
        }
    }

    async fn acquire(&mut self, id: Uuid, api_key: String) -> Result<()> {
        let input = self.devices.open_input(self.config.audio.input_sample_rate)?;
        log::info!(
            "Input device open at {} Hz (requested {})",
            input.sample_rate(),
            self.config.audio.input_sample_rate
        );
        self.input = Some(input);

        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        self.ended_rx = Some(ended_rx);
        let mut output = self
            .devices
            .open_output(self.config.audio.output_sample_rate, ended_tx)?;
        log::info!(
            "Output device open at {} Hz (requested {})",
            output.sample_rate(),
            self.config.audio.output_sample_rate
        );
        let resumed = output.resume();
        self.scheduler = Some(PlaybackScheduler::new(
            output,
            &self.config.playback,
            self.pitch_cents,
        ));
        resumed?;

        let request = SessionRequest {
            id,
            url: self.config.ws_url.clone(),
            api_key,
            model: self.config.model.clone(),
            voice: self.config.voice.clone(),
            input_mime_type: self.config.input_mime_type(),
        };
        let (net_tx, net_rx) = mpsc::channel::<NetEvent>(100);
        self.net_rx = Some(net_rx);
        let sender = self.transport.open(request, net_tx).await?;
        self.outbound = Some(sender);
        Ok(())
    }

    /// End the session from any state.
    pub fn disconnect(&mut self) {
        self.teardown();
        self.transition(Transition::Disconnect, None);
    }

    /// Detune for future playback, ramped onto whatever is playing now.
    pub fn set_pitch(&mut self, cents: f32) {
        self.pitch_cents = cents;
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.set_pitch(cents);
        }
        log::info!("Pitch set to {} cents", cents);
    }

    /// Wait for the next event of the live session.
    ///
    /// Returns `None` immediately when nothing is live.
    pub async fn next_event(&mut self) -> Option<ControllerEvent> {
        loop {
            if self.net_rx.is_none() && self.capture_rx.is_none() && self.ended_rx.is_none() {
                return None;
            }
            let polled = tokio::select! {
                step = recv_bounded(&mut self.net_rx) => Polled::Net(step),
                step = recv_bounded(&mut self.capture_rx) => Polled::Capture(step),
                step = recv_unbounded(&mut self.ended_rx) => Polled::Ended(step),
            };
            // 通道关闭后不再轮询，避免空转
            match polled {
                Polled::Net(Step::Ready(ev)) => return Some(ControllerEvent::Net(ev)),
                Polled::Capture(Step::Ready(frame)) => return Some(ControllerEvent::Capture(frame)),
                Polled::Ended(Step::Ready(id)) => return Some(ControllerEvent::SourceEnded(id)),
                Polled::Net(Step::Drained) => self.net_rx = None,
                Polled::Capture(Step::Drained) => self.capture_rx = None,
                Polled::Ended(Step::Drained) => self.ended_rx = None,
            }
        }
    }

    /// Wait for and handle one event. Returns false when nothing is live.
    pub async fn process_next(&mut self) -> bool {
        match self.next_event().await {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    pub fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Net(event) => self.handle_net_event(event),
            ControllerEvent::Capture(frame) => {
                if self.state != SessionState::Connected {
                    return;
                }
                if let (Some(capture), Some(session)) = (self.capture.as_mut(), self.outbound.as_ref()) {
                    capture.push(&frame, session);
                }
            }
            ControllerEvent::SourceEnded(id) => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.on_source_ended(id);
                }
            }
        }
    }

    fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Opened => {
                if self.state != SessionState::Connecting {
                    return;
                }
                if let Err(e) = self.start_capture() {
                    log::error!("Failed to start capture: {}", e);
                    self.fail(setup_failure(&e));
                    return;
                }
                self.transition(Transition::Opened, None);
            }
            NetEvent::Audio(blob) => {
                if self.state != SessionState::Connected {
                    return;
                }
                if let Err(e) = self.play_chunk(&blob) {
                    log::debug!("Dropping inbound audio chunk: {}", e);
                }
            }
            NetEvent::Interrupted => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.interrupt();
                }
            }
            NetEvent::TurnComplete => log::debug!("Turn complete"),
            NetEvent::Text(text) => log::info!("Model: {}", text),
            NetEvent::Closed(reason) => {
                if !self.state.is_active() {
                    return;
                }
                log::info!("Session closed: {}", reason.as_deref().unwrap_or("no reason"));
                self.teardown();
                self.transition(Transition::Closed, None);
            }
            NetEvent::Failed(cause) => {
                if !self.state.is_active() {
                    return;
                }
                self.fail(cause.user_message());
            }
        }
    }

    fn start_capture(&mut self) -> Result<()> {
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| Error::Device("input device is not open".to_string()))?;
        let (capture_tx, capture_rx) = mpsc::channel::<AudioFrame>(32);
        input.start(capture_tx)?;
        self.capture_rx = Some(capture_rx);
        self.capture = Some(CapturePipeline::new(
            self.config.audio.input_sample_rate,
            self.observer.clone(),
        ));
        Ok(())
    }

    fn play_chunk(&mut self, blob: &Blob) -> Result<()> {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return Ok(());
        };
        let rate = pcm_codec::parse_mime_rate(&blob.mime_type)?
            .unwrap_or(self.config.audio.output_sample_rate);
        let bytes = pcm_codec::from_base64(&blob.data)?;
        let frame = pcm_codec::decode(&bytes, rate, 1);
        if frame.is_empty() {
            return Ok(());
        }
        (self.observer)(0.0, rms(frame.channel(0)));
        scheduler.schedule(frame)?;
        Ok(())
    }

    fn fail(&mut self, message: String) {
        log::error!("{}", message);
        self.teardown();
        self.transition(Transition::Failed, Some(message));
    }

    /// Release every session resource. Safe to call repeatedly.
    fn teardown(&mut self) {
        // 先断开采集通道，采集线程随后退出
        self.capture_rx = None;
        if let Some(capture) = self.capture.take() {
            if capture.dropped() > 0 {
                log::debug!("{} capture frames were dropped this session", capture.dropped());
            }
        }
        if let Some(mut input) = self.input.take() {
            input.stop();
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.close();
        }
        if let Some(session) = self.outbound.take() {
            session.close();
        }
        self.net_rx = None;
        self.ended_rx = None;
        if let Some(id) = self.session_id.take() {
            log::info!("Session {}: resources released", id);
        }
    }

    fn transition(&mut self, transition: Transition, error: Option<String>) {
        match self.state.apply(transition) {
            Some(next) => {
                if next != self.state {
                    log::info!("Session state: {} -> {}", self.state, next);
                }
                self.state = next;
                self.status.send_replace(SessionStatus { state: next, error });
            }
            None => log::debug!("Ignoring {:?} while {}", transition, self.state),
        }
    }

    /// Drive the controller until `Shutdown` or the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ControlCommand>) {
        enum Next {
            Command(Option<ControlCommand>),
            Event(ControllerEvent),
        }

        loop {
            let next = tokio::select! {
                cmd = commands.recv() => Next::Command(cmd),
                Some(event) = self.next_event() => Next::Event(event),
            };
            match next {
                Next::Event(event) => self.handle_event(event),
                Next::Command(Some(ControlCommand::Connect)) => self.connect().await,
                Next::Command(Some(ControlCommand::Disconnect)) => self.disconnect(),
                Next::Command(Some(ControlCommand::SetPitch(cents))) => self.set_pitch(cents),
                Next::Command(Some(ControlCommand::Shutdown)) | Next::Command(None) => {
                    self.disconnect();
                    break;
                }
            }
        }
        log::info!("Session controller stopped");
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn setup_failure(error: &Error) -> String {
    FailureCause::Error {
        message: Some(error.to_string()),
        status: None,
    }
    .user_message()
}
