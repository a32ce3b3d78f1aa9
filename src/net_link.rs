use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::connect_async;
use url::Url;
use uuid::Uuid;

use crate::audio::frame::EncodedFrame;
use crate::audio::pcm_codec;
use crate::protocol::{Blob, ClientMessage, ServerMessage};
use crate::{Error, Result};

/// Shown when the transport fails without saying why.
pub const NETWORK_OR_KEY_MESSAGE: &str =
    "Network error or invalid API key. Please check your connection and key.";

/// Events surfaced by one session.
#[derive(Debug)]
pub enum NetEvent {
    /// Setup acknowledged; audio may flow
    Opened,
    /// One inbound audio chunk, still text-encoded
    Audio(Blob),
    /// The remote turn was cut off by the user
    Interrupted,
    TurnComplete,
    Text(String),
    /// The remote end closed the session
    Closed(Option<String>),
    Failed(FailureCause),
}

#[derive(Debug)]
pub enum NetCommand {
    SendAudio(EncodedFrame),
    Close,
}

/// Shapes a transport failure can take.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    /// A typed error, possibly with an HTTP status from the handshake
    Error {
        message: Option<String>,
        status: Option<u16>,
    },
    /// The connection dropped with no error attached
    Event,
    /// Anything else the transport produced
    Opaque(serde_json::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Credential,
    Generic,
}

impl FailureCause {
    /// Human-readable message: explicit message first, then the canned
    /// network/key hint for bare events, then a serialized fallback.
    pub fn describe(&self) -> String {
        match self {
            FailureCause::Error {
                message: Some(message),
                ..
            } if !message.trim().is_empty() => message.clone(),
            FailureCause::Event => NETWORK_OR_KEY_MESSAGE.to_string(),
            FailureCause::Error { status, .. } => json!({ "status": status }).to_string(),
            FailureCause::Opaque(value) => value.to_string(),
        }
    }

    pub fn classify(&self) -> ErrorClass {
        match self {
            FailureCause::Error {
                status: Some(401 | 403),
                ..
            } => ErrorClass::Credential,
            FailureCause::Error {
                message: Some(message),
                ..
            } => {
                let lower = message.to_lowercase();
                let credential = ["api key", "permission", "unauthorized", "unauthenticated", "forbidden"]
                    .iter()
                    .any(|needle| lower.contains(needle));
                if credential {
                    ErrorClass::Credential
                } else {
                    ErrorClass::Generic
                }
            }
            _ => ErrorClass::Generic,
        }
    }

    /// The single message surfaced for a failed session.
    pub fn user_message(&self) -> String {
        match self.classify() {
            ErrorClass::Credential => {
                format!("Credential or permission problem: {}", self.describe())
            }
            ErrorClass::Generic => format!("Connection error: {}", self.describe()),
        }
    }
}

fn failure_from_ws(e: tungstenite::Error) -> FailureCause {
    match e {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            FailureCause::Error {
                message: Some(format!("handshake rejected with HTTP {}", status)),
                status: Some(status.as_u16()),
            }
        }
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            FailureCause::Event
        }
        other => FailureCause::Error {
            message: Some(other.to_string()),
            status: None,
        },
    }
}

/// Outbound half of an open session.
#[derive(Clone)]
pub struct SessionSender {
    tx: mpsc::Sender<NetCommand>,
}

impl SessionSender {
    pub fn new(tx: mpsc::Sender<NetCommand>) -> Self {
        Self { tx }
    }

    /// Queue one frame without waiting. Fails when the session is gone or
    /// backlogged; the frame is dropped in that case.
    pub fn send_audio(&self, frame: EncodedFrame) -> Result<()> {
        self.tx.try_send(NetCommand::SendAudio(frame)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Send("backlogged"),
            mpsc::error::TrySendError::Closed(_) => Error::Send("closed"),
        })
    }

    /// Ask the link to close. Best effort.
    pub fn close(&self) {
        let _ = self.tx.try_send(NetCommand::Close);
    }
}

/// Everything needed to open one session.
#[derive(Clone)]
pub struct SessionRequest {
    pub id: Uuid,
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    /// Tag declared on every outbound chunk, e.g. `audio/pcm;rate=16000`
    pub input_mime_type: String,
}

/// Endpoint for `request` with the credential as the `key` query parameter.
pub fn session_url(request: &SessionRequest) -> Result<Url> {
    let mut url = Url::parse(&request.url)
        .map_err(|e| Error::Transport(format!("invalid session url '{}': {}", request.url, e)))?;
    url.query_pairs_mut().append_pair("key", &request.api_key);
    Ok(url)
}

/// Opens remote sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a session. Its lifecycle is reported on `events`; connection
    /// failures after this returns arrive as `NetEvent::Failed`.
    async fn open(
        &self,
        request: SessionRequest,
        events: mpsc::Sender<NetEvent>,
    ) -> Result<SessionSender>;
}

/// Websocket transport: one `NetLink` task per session.
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(
        &self,
        request: SessionRequest,
        events: mpsc::Sender<NetEvent>,
    ) -> Result<SessionSender> {
        let url = session_url(&request)?;
        let (tx_cmd, rx_cmd) = mpsc::channel::<NetCommand>(64);
        let link = NetLink::new(url, request, events, rx_cmd);
        tokio::spawn(async move {
            link.run().await;
        });
        Ok(SessionSender::new(tx_cmd))
    }
}

enum LinkExit {
    Closed(Option<String>),
    Shutdown,
}

pub struct NetLink {
    url: Url,
    request: SessionRequest,
    tx: mpsc::Sender<NetEvent>,
    rx_cmd: mpsc::Receiver<NetCommand>,
    opened: bool,
}

impl NetLink {
    pub fn new(
        url: Url,
        request: SessionRequest,
        tx: mpsc::Sender<NetEvent>,
        rx_cmd: mpsc::Receiver<NetCommand>,
    ) -> Self {
        Self {
            url,
            request,
            tx,
            rx_cmd,
            opened: false,
        }
    }

    // 单次会话，不做重连
    pub async fn run(mut self) {
        let session = self.request.id;
        let event = match self.connect_and_loop().await {
            Ok(LinkExit::Shutdown) => {
                log::info!("Session {} shut down locally", session);
                return;
            }
            Ok(LinkExit::Closed(reason)) => {
                log::info!("Session {} closed by server: {:?}", session, reason);
                NetEvent::Closed(reason)
            }
            Err(cause) => {
                log::error!("Session {} failed: {}", session, cause.describe());
                NetEvent::Failed(cause)
            }
        };
        let _ = self.tx.send(event).await;
    }

    async fn connect_and_loop(&mut self) -> std::result::Result<LinkExit, FailureCause> {
        log::info!("Session {}: connecting to {}...", self.request.id, self.request.url);

        let (ws_stream, _) = connect_async(self.url.as_str()).await.map_err(failure_from_ws)?;
        let (mut write, mut read) = ws_stream.split();

        // 握手后立即发送 setup
        let setup = ClientMessage::setup(&self.request.model, &self.request.voice);
        let setup_json = setup.to_json().map_err(|e| FailureCause::Error {
            message: Some(e.to_string()),
            status: None,
        })?;
        log::debug!("Sending setup: {}", setup_json);
        write
            .send(Message::Text(setup_json.into()))
            .await
            .map_err(failure_from_ws)?;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !self.dispatch(text.as_str()).await {
                                return Ok(LinkExit::Shutdown);
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            match std::str::from_utf8(&data) {
                                Ok(text) => {
                                    if !self.dispatch(text).await {
                                        return Ok(LinkExit::Shutdown);
                                    }
                                }
                                Err(_) => log::debug!("Ignoring non-UTF-8 binary frame ({} bytes)", data.len()),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame.map(|f| format!("{} ({})", f.reason.as_str(), u16::from(f.code)));
                            return Ok(LinkExit::Closed(reason));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(failure_from_ws(e)),
                        None => return Err(FailureCause::Event),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(NetCommand::SendAudio(frame)) => {
                            let blob = Blob {
                                mime_type: self.request.input_mime_type.clone(),
                                data: pcm_codec::to_base64(&frame),
                            };
                            let text = match ClientMessage::audio(blob).to_json() {
                                Ok(text) => text,
                                Err(e) => {
                                    log::debug!("Dropping unserializable frame: {}", e);
                                    continue;
                                }
                            };
                            write.send(Message::Text(text.into())).await.map_err(failure_from_ws)?;
                        }
                        Some(NetCommand::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(LinkExit::Shutdown);
                        }
                    }
                }
            }
        }
    }

    /// Turn one server message into events. Returns false once nobody is
    /// listening any more.
    async fn dispatch(&mut self, text: &str) -> bool {
        let msg = match ServerMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Ignoring unparseable server message: {}", e);
                return true;
            }
        };

        let mut events = Vec::new();
        if msg.setup_complete.is_some() && !self.opened {
            self.opened = true;
            events.push(NetEvent::Opened);
        }
        if msg.is_interrupted() {
            events.push(NetEvent::Interrupted);
        }
        events.extend(msg.audio_chunks().cloned().map(NetEvent::Audio));
        if let Some(turn) = msg.server_content.as_ref().and_then(|c| c.model_turn.as_ref()) {
            events.extend(turn.parts.iter().filter_map(|p| p.text.clone()).map(NetEvent::Text));
        }
        if msg.is_turn_complete() {
            events.push(NetEvent::TurnComplete);
        }
        if msg.go_away.is_some() {
            log::warn!("Server announced it will close the session soon");
        }

        for event in events {
            if self.tx.send(event).await.is_err() {
                return false;
            }
        }
        true
    }
}
