//! Typed RFB-TV message variants and the enums they carry.

use std::collections::BTreeMap;

/// Negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[default]
    Unknown,
    V1_3,
    V2_0,
}

/// Key event action ("event" field on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Up = 0,
    Down = 1,
    Input = 2,
}

/// X11 key code as carried by KeyEvent/KeyTimeEvent.
pub type X11KeyCode = u32;

/// Reason carried on an outbound SessionTerminateIndication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    Normal = 0,
    Suspend = 1,
    Handoff = 2,
    ClientExecutionError = 3,
}

/// Server's verdict on a SessionSetup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSetupResult {
    Ok,
    Redirect,
    InvalidClientId,
    AppNotFound,
    ConfigError,
    NoResources,
    UnspecifiedError,
    InvalidParameters,
    InternalServerError,
    UndefinedError,
}

impl SessionSetupResult {
    /// Server numeric -> internal variant, unknown codes map to `UndefinedError`.
    pub fn from_wire(code: u8) -> Self {
        match code {
            0 => SessionSetupResult::Ok,
            1 => SessionSetupResult::Redirect,
            2 => SessionSetupResult::InvalidClientId,
            3 | 7 => SessionSetupResult::AppNotFound,
            4 => SessionSetupResult::ConfigError,
            5 => SessionSetupResult::NoResources,
            6 | 255 => SessionSetupResult::UnspecifiedError,
            8 => SessionSetupResult::InvalidParameters,
            9 => SessionSetupResult::InternalServerError,
            _ => SessionSetupResult::UndefinedError,
        }
    }
}

/// Server-requested session termination reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTerminateReason {
    UserStop,
    InsufficientBandwidth,
    LatencyTooLarge,
    Suspend,
    UnspecifiedError,
    DoNotRetune,
    PingTimeout,
    InternalServerError,
    ServerShuttingDown,
    FailedApplicationStreamSetup,
    UndefinedError,
}

impl SessionTerminateReason {
    pub fn from_wire(code: u8) -> Self {
        match code {
            0 => SessionTerminateReason::UserStop,
            10 => SessionTerminateReason::InsufficientBandwidth,
            11 => SessionTerminateReason::LatencyTooLarge,
            12 => SessionTerminateReason::Suspend,
            13 | 255 => SessionTerminateReason::UnspecifiedError,
            14 => SessionTerminateReason::DoNotRetune,
            15 => SessionTerminateReason::PingTimeout,
            16 => SessionTerminateReason::InternalServerError,
            17 => SessionTerminateReason::ServerShuttingDown,
            18 => SessionTerminateReason::FailedApplicationStreamSetup,
            _ => SessionTerminateReason::UndefinedError,
        }
    }
}

/// Client's answer to a StreamSetupRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSetupResponseCode {
    Success,
    CableTuningError,
    IpResourceError,
    UnsupportedUri,
    ConnectionFailed,
    UnspecifiedError,
}

impl StreamSetupResponseCode {
    pub fn to_wire(self, version: ProtocolVersion) -> u8 {
        let is_v1_3 = version == ProtocolVersion::V1_3;
        match self {
            StreamSetupResponseCode::Success => 0,
            StreamSetupResponseCode::CableTuningError => 20,
            StreamSetupResponseCode::IpResourceError => 21,
            StreamSetupResponseCode::UnsupportedUri => 22,
            StreamSetupResponseCode::ConnectionFailed => {
                if is_v1_3 {
                    21
                } else {
                    24
                }
            }
            StreamSetupResponseCode::UnspecifiedError => {
                if is_v1_3 {
                    21
                } else {
                    255
                }
            }
        }
    }
}

/// Stream confirmation code, sent once the player reported on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamConfirmCode {
    Success,
    DescrambleError,
    DecodeError,
    TsidError,
    NidError,
    PidError,
    PhysicalError,
    UnspecifiedError,
}

impl StreamConfirmCode {
    pub fn to_wire(self, version: ProtocolVersion) -> u8 {
        match self {
            StreamConfirmCode::Success => 0,
            StreamConfirmCode::DescrambleError => 30,
            StreamConfirmCode::DecodeError => 31,
            StreamConfirmCode::TsidError => 32,
            StreamConfirmCode::NidError => 33,
            StreamConfirmCode::PidError => 34,
            StreamConfirmCode::PhysicalError => 35,
            StreamConfirmCode::UnspecifiedError => {
                if version == ProtocolVersion::V1_3 {
                    36
                } else {
                    255
                }
            }
        }
    }
}

/// Outcome of a server-directed handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffResult {
    Success,
    UnsupportedUri,
    FailedToDescrambleStream,
    FailedToDecodeStream,
    NoTransportStreamWithIndicatedId,
    NoNetworkWithIndicatedId,
    NoProgramWithIndicatedId,
    PhysicalLayerError,
    RequiredMediaPlayerAbsent,
    ErroneousRequest,
    AssetNotFound,
    TransportLayerError,
    PlayerError,
    AppNotFound,
    UnspecifiedError,
}

impl HandoffResult {
    pub fn to_wire(self) -> u8 {
        match self {
            HandoffResult::UnsupportedUri => 22,
            HandoffResult::FailedToDescrambleStream => 30,
            HandoffResult::FailedToDecodeStream => 31,
            HandoffResult::NoTransportStreamWithIndicatedId => 32,
            HandoffResult::NoNetworkWithIndicatedId => 33,
            HandoffResult::NoProgramWithIndicatedId => 34,
            HandoffResult::PhysicalLayerError => 35,
            HandoffResult::RequiredMediaPlayerAbsent => 41,
            HandoffResult::ErroneousRequest => 42,
            HandoffResult::AssetNotFound => 43,
            HandoffResult::TransportLayerError => 50,
            HandoffResult::PlayerError => 51,
            HandoffResult::AppNotFound => 52,
            HandoffResult::Success | HandoffResult::UnspecifiedError => 255,
        }
    }
}

/// CDM session setup result (RFB-TV 2.0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdmSetupResponseResult {
    Success = 0,
    LicenseNotFound = 60,
    DrmSystemNotInstalled = 61,
    DrmSystemError = 62,
    NoLicenseServer = 68,
    UnspecifiedError = 255,
}

/// CDM session termination reason (RFB-TV 2.0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdmTerminateReason {
    UserStop = 0,
    Other = 1,
    ServerRequest = 2,
    EndOfStream = 3,
    LicenseExpired = 4,
    UnknownSession = 5,
}

/// Report mode requested by a server command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    NoChange,
    Disabled,
    OneShot,
    Automatic,
    Accumulate,
}

/// Video decode mode requested by a server command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoMode {
    NoChange,
    GuiOptimized,
    VideoOptimized,
}

/// Minimum level accepted by the log report; numeric order is inverted
/// (lower value = higher severity), matching the wire levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warning = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// One framebuffer rectangle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rectangle {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
    pub alpha: u8,
    pub content: RectangleContent,
}

/// Rectangle payload: inline picture object or a URL to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RectangleContent {
    Picture(Vec<u8>),
    Url(String),
}

/// Server -> client messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    FramebufferUpdate {
        rectangles: Vec<Rectangle>,
        clear: bool,
        commit: bool,
    },
    SessionSetupResponse {
        result: SessionSetupResult,
        session_id: String,
        redirect_url: String,
        cookie: String,
    },
    SessionTerminateRequest {
        reason: SessionTerminateReason,
    },
    Ping,
    StreamSetupRequest {
        uri: String,
        params: BTreeMap<String, String>,
    },
    PassThrough {
        protocol_id: String,
        data: Vec<u8>,
    },
    ServerCommand(ServerCommand),
    HandoffRequest {
        uri: String,
        resume_session_when_done: bool,
    },
    CdmSetupRequest {
        cdm_session_id: String,
        drm_system_id: [u8; 16],
        session_type: String,
        init_data: BTreeMap<String, String>,
    },
    CdmTerminateRequest {
        cdm_session_id: String,
        reason: CdmTerminateReason,
    },
}

/// Parsed server command, dispatched on the command name string.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCommand {
    KeyFilterControl {
        local_keys: String,
        remote_keys: String,
    },
    PlaybackControl {
        mode: ReportMode,
        interval_ms: u32,
    },
    LatencyControl {
        mode: ReportMode,
        is_duration: bool,
        is_event: bool,
    },
    LogControl {
        mode: ReportMode,
        min_level: Option<LogLevel>,
    },
    VideoControl {
        mode: VideoMode,
    },
    UnderrunMitigationControl {
        params: BTreeMap<String, String>,
    },
    /// Unrecognized command; kept for the warning path, never fatal.
    Unknown {
        command: String,
    },
}
