//! Device link command table and typed views of command payloads.
//!
//! The device speaks a small command-oriented protocol.  Every frame carries a
//! single command byte and an opaque payload; the meaning of the payload
//! depends on the command.  This module names the commands and provides
//! parsers for the payloads the host needs to interpret (acknowledgements,
//! program exit status, image format replies, install progress).
//!
//! Parsing here is deliberately forgiving: the device firmware is the source
//! of truth, so short payloads map to "failure" rather than to an error.

use serde::{Deserialize, Serialize};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Fixed 4-byte marker at the start of every frame.
pub const MAGIC: [u8; 4] = [0xAC, 0xBE, 0xCB, 0xCA];

/// Protocol version byte.  The device only understands version 0.
pub const PROTOCOL_VERSION: u8 = 0x00;

/// Size of `MAGIC` + `LEN`, the part of the frame read before the length is known.
pub const HEADER_SIZE: usize = 8;

/// Smallest possible frame: header + version + command + checksum.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 3;

/// TCP port of the device's WebSocket endpoint.
pub const DEVICE_PORT: u16 = 7899;

/// Client identifier sent in the `Auth` payload.
pub const DEFAULT_CLIENT_TOKEN: &str = "maixvision";

// ── Command codes ─────────────────────────────────────────────────────────────

/// All command codes understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    Auth = 1,
    AuthAck = 2,
    Run = 3,
    RunAck = 4,
    Output = 5,
    Img = 6,
    Stop = 7,
    StopAck = 8,
    Finish = 9,
    Msg = 10,
    Heartbeat = 11,
    DeviceInfo = 12,
    DeviceInfoAck = 13,
    ImgFormat = 14,
    ImgFormatAck = 15,
    InstallApp = 16,
    InstallAppAck = 17,
    RunProject = 18,
    UpdateRuntime = 19,
    UpdateRuntimeAck = 20,
}

impl TryFrom<u8> for Command {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            1 => Ok(Command::Auth),
            2 => Ok(Command::AuthAck),
            3 => Ok(Command::Run),
            4 => Ok(Command::RunAck),
            5 => Ok(Command::Output),
            6 => Ok(Command::Img),
            7 => Ok(Command::Stop),
            8 => Ok(Command::StopAck),
            9 => Ok(Command::Finish),
            10 => Ok(Command::Msg),
            11 => Ok(Command::Heartbeat),
            12 => Ok(Command::DeviceInfo),
            13 => Ok(Command::DeviceInfoAck),
            14 => Ok(Command::ImgFormat),
            15 => Ok(Command::ImgFormatAck),
            16 => Ok(Command::InstallApp),
            17 => Ok(Command::InstallAppAck),
            18 => Ok(Command::RunProject),
            19 => Ok(Command::UpdateRuntime),
            20 => Ok(Command::UpdateRuntimeAck),
            _ => Err(()),
        }
    }
}

impl Command {
    /// Returns `true` for commands that only ever travel host → device.
    pub fn is_host_originated(self) -> bool {
        matches!(
            self,
            Command::Auth
                | Command::Run
                | Command::Stop
                | Command::DeviceInfo
                | Command::ImgFormat
                | Command::InstallApp
                | Command::RunProject
                | Command::UpdateRuntime
        )
    }
}

// ── Frame payloads ────────────────────────────────────────────────────────────

/// Payload handed to the encoder.
///
/// Numbers are serialised as 8 little-endian bytes, text as its UTF-8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    Empty,
    Number(u64),
    Text(&'a str),
    Bytes(&'a [u8]),
}

impl<'a> From<&'a str> for Payload<'a> {
    fn from(value: &'a str) -> Self {
        Payload::Text(value)
    }
}

impl<'a> From<&'a [u8]> for Payload<'a> {
    fn from(value: &'a [u8]) -> Self {
        Payload::Bytes(value)
    }
}

impl From<u64> for Payload<'_> {
    fn from(value: u64) -> Self {
        Payload::Number(value)
    }
}

/// One decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    /// Payload decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

// ── Typed payload views ───────────────────────────────────────────────────────

/// `AuthAck`, `RunAck`, `StopAck` payload: a success byte and an optional reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub success: bool,
    /// Remaining bytes after the status byte, decoded as UTF-8.
    pub detail: String,
}

impl Ack {
    pub fn parse(payload: &[u8]) -> Self {
        let success = payload.first() == Some(&1);
        let detail = payload
            .get(1..)
            .map(|rest| String::from_utf8_lossy(rest).into_owned())
            .unwrap_or_default();
        Self { success, detail }
    }
}

/// How a program on the device ended, parsed from a `Finish` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    /// The first four bytes were all zero.
    Clean,
    /// Non-zero little-endian exit code plus the device's error text.
    Failed { code: u32, message: String },
}

impl ExitStatus {
    pub fn parse(payload: &[u8]) -> Self {
        let mut code_bytes = [0u8; 4];
        let head = payload.len().min(4);
        code_bytes[..head].copy_from_slice(&payload[..head]);

        if code_bytes == [0, 0, 0, 0] {
            return ExitStatus::Clean;
        }

        ExitStatus::Failed {
            code: u32::from_le_bytes(code_bytes),
            message: String::from_utf8_lossy(payload.get(4..).unwrap_or_default()).into_owned(),
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, ExitStatus::Clean)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Clean => write!(f, "Program exited"),
            ExitStatus::Failed { code, message } if message.is_empty() => {
                write!(f, "Program exit failed. Exit code: {code}.")
            }
            ExitStatus::Failed { code, message } => {
                write!(f, "Program exit failed. Exit code: {code}. Msg: {message}")
            }
        }
    }
}

/// Image encoding tag used by `Img` and `ImgFormat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ImageFormat {
    Jpeg = 1,
    Png = 2,
}

impl TryFrom<u8> for ImageFormat {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ImageFormat::Jpeg),
            2 => Ok(ImageFormat::Png),
            _ => Err(()),
        }
    }
}

impl ImageFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Png => "PNG",
        }
    }
}

/// Split an `Img` payload into its format tag and the image bytes.
///
/// Returns `None` for an empty payload.
pub fn split_image_payload(payload: &[u8]) -> Option<(u8, &[u8])> {
    payload.split_first().map(|(tag, data)| (*tag, data))
}

/// `ImgFormatAck` payload: `[1, tag]` on success, `[0, _, reason..]` on failure.
pub fn parse_image_format_ack(payload: &[u8]) -> Result<Option<ImageFormat>, String> {
    if payload.first() == Some(&1) {
        Ok(payload.get(1).and_then(|t| ImageFormat::try_from(*t).ok()))
    } else {
        Err(String::from_utf8_lossy(payload.get(2..).unwrap_or_default()).into_owned())
    }
}

/// `InstallAppAck` payload: `[progress, status, reason..]`; status 0 means success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallProgress {
    pub progress: u8,
    pub result: Result<(), String>,
}

impl InstallProgress {
    pub fn parse(payload: &[u8]) -> Self {
        if payload.get(1) == Some(&0) {
            Self {
                progress: payload[0],
                result: Ok(()),
            }
        } else {
            Self {
                progress: 0,
                result: Err(
                    String::from_utf8_lossy(payload.get(2..).unwrap_or_default()).into_owned(),
                ),
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
