//! Device link protocol state machine.
//!
//! [`LinkStateMachine`] holds everything a link knows about the protocol
//! conversation with one device and decides how to react to each frame.  It
//! performs no I/O: every reaction is returned as a list of [`Action`]s that
//! the link's I/O task carries out in order.  This keeps the whole protocol
//! testable with plain synchronous unit tests.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect──► Connecting ──socket open──► Authenticating
//!                                                            │ AuthAck [1]
//!                                                            ▼
//!                        Running ◄──RunAck [1]──────────── Ready
//!                           │ ──StopAck [1] / Finish──────►  │
//!                           └──────────── close ─────────────┴──► Disconnected
//! ```

use std::time::Duration;

use bytes::Bytes;
use maix_core::protocol::messages::{
    parse_image_format_ack, split_image_payload, Ack, InstallProgress,
};
use maix_core::{Command, DeviceMetadata, ExitStatus, Frame, ImageFormat, ProtocolError};
use thiserror::Error;
use tracing::{debug, warn};

// ── State and events ──────────────────────────────────────────────────────────

/// Connection state of one device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Authenticating,
    /// Authenticated and idle.
    Ready,
    /// A program is executing on the device.
    Running,
}

impl LinkState {
    /// `true` once the handshake has succeeded and until the link closes.
    pub fn is_connected(self) -> bool {
        matches!(self, LinkState::Ready | LinkState::Running)
    }
}

/// Errors reported by a device link.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// A received message could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The device rejected the `Auth` token.
    #[error("handshake rejected by device: {0}")]
    Handshake(String),

    /// No frame was sent or received within the heartbeat window.
    #[error("no traffic from device for {0:?}")]
    HeartbeatTimeout(Duration),

    /// The device refused or failed a requested operation.
    #[error("device reported failure: {0}")]
    Execution(String),

    /// The operation is not allowed in the link's current state.
    #[error("cannot {operation} while link is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: LinkState,
    },

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The link has no open connection.
    #[error("link is not connected")]
    NotConnected,
}

/// Everything a link reports to its observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The socket opened; the `Auth` frame has been queued.
    Opened,
    /// Every decoded frame, before any typed event it produces.
    Frame(Frame),
    Authenticated,
    DeviceInfo(DeviceMetadata),
    RunStarted,
    Stopped,
    /// Program standard output.
    Output(String),
    /// Informational message from the device runtime.
    Message(String),
    /// A camera frame; `format_tag` is interpreted by the consumer.
    Image { format_tag: u8, data: Bytes },
    Finished(ExitStatus),
    ImageFormatChanged(Result<ImageFormat, String>),
    InstallProgress { progress: u8 },
    RuntimeUpdated { success: bool },
    Error(LinkError),
    Closed { reason: String },
}

/// A side effect requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Encode and write this frame to the socket.
    Send(Frame),
    /// Publish this event to observers.
    Emit(LinkEvent),
    /// Report the error and close the link.
    Disconnect(LinkError),
}

// ── State machine ─────────────────────────────────────────────────────────────

/// Protocol state for one device link.
#[derive(Debug)]
pub struct LinkStateMachine {
    state: LinkState,
    client_token: String,
    metadata: Option<DeviceMetadata>,
}

impl LinkStateMachine {
    pub fn new(client_token: impl Into<String>) -> Self {
        Self {
            state: LinkState::Disconnected,
            client_token: client_token.into(),
            metadata: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Metadata from the last `DeviceInfoAck`, if any.
    pub fn metadata(&self) -> Option<&DeviceMetadata> {
        self.metadata.as_ref()
    }

    // ── Connection lifecycle ─────────────────────────────────────────────────

    pub fn on_connect_started(&mut self) {
        self.state = LinkState::Connecting;
        self.metadata = None;
    }

    /// Socket is open: authenticate.
    pub fn on_open(&mut self) -> Vec<Action> {
        self.state = LinkState::Authenticating;
        vec![
            Action::Send(Frame::new(Command::Auth, self.client_token.as_bytes())),
            Action::Emit(LinkEvent::Opened),
        ]
    }

    /// The connection is gone.  Returns `true` if the link was open, i.e. if
    /// a `Closed` event is due.
    pub fn on_closed(&mut self) -> bool {
        let was_open = self.state != LinkState::Disconnected;
        self.state = LinkState::Disconnected;
        self.metadata = None;
        was_open
    }

    // ── Inbound frames ───────────────────────────────────────────────────────

    /// Reacts to one decoded frame from the device.
    pub fn on_frame(&mut self, frame: Frame) -> Vec<Action> {
        let mut actions = vec![Action::Emit(LinkEvent::Frame(frame.clone()))];
        let payload = frame.payload.as_slice();

        match frame.command {
            Command::AuthAck => {
                if self.state != LinkState::Authenticating {
                    debug!("AuthAck outside handshake ignored (state {:?})", self.state);
                    return actions;
                }
                let ack = Ack::parse(payload);
                if ack.success {
                    self.state = LinkState::Ready;
                    actions.push(Action::Emit(LinkEvent::Authenticated));
                    actions.push(Action::Send(Frame::new(Command::DeviceInfo, Vec::new())));
                } else {
                    actions.push(Action::Disconnect(LinkError::Handshake(ack.detail)));
                }
            }
            Command::RunAck => {
                let ack = Ack::parse(payload);
                if ack.success {
                    if self.state.is_connected() {
                        self.state = LinkState::Running;
                    }
                    actions.push(Action::Emit(LinkEvent::RunStarted));
                } else {
                    actions.push(Action::Emit(LinkEvent::Error(LinkError::Execution(
                        failure_text("run rejected by device", ack.detail),
                    ))));
                }
            }
            Command::StopAck => {
                let ack = Ack::parse(payload);
                if ack.success {
                    if self.state.is_connected() {
                        self.state = LinkState::Ready;
                    }
                    actions.push(Action::Emit(LinkEvent::Stopped));
                } else {
                    actions.push(Action::Emit(LinkEvent::Error(LinkError::Execution(
                        failure_text("stop rejected by device", ack.detail),
                    ))));
                }
            }
            Command::Finish => {
                if self.state.is_connected() {
                    self.state = LinkState::Ready;
                }
                actions.push(Action::Emit(LinkEvent::Finished(ExitStatus::parse(payload))));
            }
            Command::Output => actions.push(Action::Emit(LinkEvent::Output(frame.text()))),
            Command::Msg => actions.push(Action::Emit(LinkEvent::Message(frame.text()))),
            Command::Img => match split_image_payload(payload) {
                Some((format_tag, data)) => actions.push(Action::Emit(LinkEvent::Image {
                    format_tag,
                    data: Bytes::copy_from_slice(data),
                })),
                None => debug!("empty Img payload dropped"),
            },
            Command::Heartbeat => {
                actions.push(Action::Send(Frame::new(Command::Heartbeat, Vec::new())));
            }
            Command::DeviceInfoAck => match DeviceMetadata::from_json(payload) {
                Ok(metadata) => {
                    self.metadata = Some(metadata.clone());
                    actions.push(Action::Emit(LinkEvent::DeviceInfo(metadata)));
                }
                Err(e) => warn!("malformed DeviceInfoAck payload ignored: {e}"),
            },
            Command::ImgFormatAck => {
                let outcome = match parse_image_format_ack(payload) {
                    Ok(Some(format)) => Ok(format),
                    Ok(None) => Err(format!(
                        "device switched to unknown format tag {:?}",
                        payload.get(1)
                    )),
                    Err(reason) => Err(reason),
                };
                actions.push(Action::Emit(LinkEvent::ImageFormatChanged(outcome)));
            }
            Command::InstallAppAck => {
                let InstallProgress { progress, result } = InstallProgress::parse(payload);
                match result {
                    Ok(()) => actions.push(Action::Emit(LinkEvent::InstallProgress { progress })),
                    Err(reason) => actions.push(Action::Emit(LinkEvent::Error(
                        LinkError::Execution(failure_text("install failed", reason)),
                    ))),
                }
            }
            Command::UpdateRuntimeAck => {
                let success = Ack::parse(payload).success;
                actions.push(Action::Emit(LinkEvent::RuntimeUpdated { success }));
            }
            Command::Auth
            | Command::Run
            | Command::Stop
            | Command::DeviceInfo
            | Command::ImgFormat
            | Command::InstallApp
            | Command::RunProject
            | Command::UpdateRuntime => {
                warn!("device sent host-only command {:?}; ignored", frame.command);
            }
        }

        actions
    }

    // ── Outbound requests ────────────────────────────────────────────────────

    pub fn request_run(&self, code: &str) -> Result<Frame, LinkError> {
        self.require(&[LinkState::Ready], "run code")?;
        Ok(Frame::new(Command::Run, code.as_bytes()))
    }

    /// `archive` is a zipped project directory.
    pub fn request_run_project(&self, archive: &[u8]) -> Result<Frame, LinkError> {
        self.require(&[LinkState::Ready], "run project")?;
        Ok(Frame::new(Command::RunProject, archive))
    }

    pub fn request_stop(&self) -> Result<Frame, LinkError> {
        self.require(&[LinkState::Ready, LinkState::Running], "stop code")?;
        Ok(Frame::new(Command::Stop, Vec::new()))
    }

    pub fn request_image_format(&self, format: ImageFormat) -> Result<Frame, LinkError> {
        self.require(&[LinkState::Ready, LinkState::Running], "set image format")?;
        Ok(Frame::new(Command::ImgFormat, vec![format as u8]))
    }

    pub fn request_install_app(&self, package: &[u8]) -> Result<Frame, LinkError> {
        self.require(&[LinkState::Ready], "install app")?;
        Ok(Frame::new(Command::InstallApp, package))
    }

    pub fn request_update_runtime(&self) -> Result<Frame, LinkError> {
        self.require(&[LinkState::Ready], "update runtime")?;
        Ok(Frame::new(Command::UpdateRuntime, Vec::new()))
    }

    fn require(&self, allowed: &[LinkState], operation: &'static str) -> Result<(), LinkError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(LinkError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

fn failure_text(fallback: &str, detail: String) -> String {
    if detail.is_empty() {
        fallback.to_string()
    } else {
        detail
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
