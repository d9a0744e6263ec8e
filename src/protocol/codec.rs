//! RFB-TV message codec.
//!
//! Pure encode/decode between [`WireBuffer`] and the typed message variants.
//! Stateless except for the negotiated protocol version, which selects the
//! set of server messages that may appear and the layout differences between
//! RFB-TV 1.3 and 2.0.

use super::messages::*;
use super::wire::WireBuffer;
use super::CodecError;
use crate::reports::{LatencyReport, LogReport, PlaybackReport};

use log::{debug, warn};

use std::collections::BTreeMap;

// Client -> server message types
const MSG_SET_ENCODINGS: u8 = 2;
const MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
const MSG_KEY_EVENT: u8 = 4;
const MSG_POINTER_EVENT: u8 = 5;
const MSG_CLIENT_REPORT: u8 = 16;
const MSG_SESSION_TERMINATE_INDICATION: u8 = 17;
const MSG_SESSION_SETUP: u8 = 18;
const MSG_STREAM_CONFIRM: u8 = 19;
const MSG_STREAM_SETUP_RESPONSE: u8 = 20;
const MSG_PONG: u8 = 21;
const MSG_PASS_THROUGH: u8 = 23;
const MSG_SESSION_UPDATE: u8 = 24;
const MSG_HANDOFF_RESULT: u8 = 25;
const MSG_KEY_TIME_EVENT: u8 = 26;
const MSG_CDM_SETUP_RESPONSE: u8 = 27;
const MSG_CDM_TERMINATE_INDICATION: u8 = 28;

// Server -> client message types
const MSG_FRAMEBUFFER_UPDATE: u8 = 0;
const MSG_SESSION_SETUP_RESPONSE: u8 = 16;
const MSG_SESSION_TERMINATE_REQUEST: u8 = 17;
const MSG_PING: u8 = 18;
const MSG_STREAM_SETUP_REQUEST: u8 = 19;
const MSG_SERVER_PASS_THROUGH: u8 = 21;
const MSG_SERVER_COMMAND: u8 = 22;
const MSG_HANDOFF_REQUEST: u8 = 23;
const MSG_CDM_SETUP_REQUEST: u8 = 24;
const MSG_CDM_TERMINATE_REQUEST: u8 = 25;

// Framebuffer rectangle encodings
const ENCODING_PICTURE_OBJECT: u32 = 42;
const ENCODING_URL: u32 = 43;

// Framebuffer bitmap flags
const RECT_FLIP_BIT: u8 = 0x1; // Called 'commit' in RFB-TV 2.0
const RECT_CLEAR_BIT: u8 = 0x2;

const VERSION_STRING_SIZE: usize = 15;

// Ranked high to low; negotiation picks the first entry the server's
// version string compares >= to.
const SUPPORTED_VERSIONS: [(ProtocolVersion, &str); 2] = [
    (ProtocolVersion::V2_0, "RFB-TV 002.000\n"),
    (ProtocolVersion::V1_3, "RFB-TV 001.001\n"),
];

/// Bi-directional RFB-TV message codec for protocol versions 1.3 and 2.0.
#[derive(Debug, Default)]
pub struct RfbtvCodec {
    version: ProtocolVersion,
}

impl RfbtvCodec {
    pub fn new() -> Self {
        RfbtvCodec::default()
    }

    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Parse the server's 15-byte version string, select the highest
    /// supported version not above it and return the client version string
    /// to echo on the wire.
    pub fn parse_version_string(
        &mut self,
        message: &mut WireBuffer,
    ) -> Result<&'static str, CodecError> {
        let server_version = message.read_raw_as_string(VERSION_STRING_SIZE);
        if message.has_underflow() {
            return Err(CodecError::NeedMoreData);
        }

        self.version = ProtocolVersion::Unknown;

        if is_rfbtv_version_format(&server_version) {
            for (version, version_string) in SUPPORTED_VERSIONS {
                // Plain lexicographic byte comparison ranks the versions
                if server_version.as_str() >= version_string {
                    self.version = version;
                    debug!("RX server version {}", server_version.trim_end());
                    debug!("TX client version {}", version_string.trim_end());
                    return Ok(version_string);
                }
            }
        }

        warn!("Cannot find a matching server version: {:?}", server_version);
        Err(CodecError::InvalidServerVersion)
    }

    //
    // Encoders
    //

    pub fn create_set_encodings(&self, is_url_encoding_supported: bool) -> WireBuffer {
        let mut msg = WireBuffer::new();
        msg.write_u8(MSG_SET_ENCODINGS);
        msg.write_u8(0); // Padding
        if is_url_encoding_supported {
            msg.write_u16(2);
            msg.write_u32(ENCODING_PICTURE_OBJECT);
            msg.write_u32(ENCODING_URL);
        } else {
            msg.write_u16(1);
            msg.write_u32(ENCODING_PICTURE_OBJECT);
        }
        msg
    }

    pub fn create_frame_buffer_update_request(&self, width: u16, height: u16) -> WireBuffer {
        let mut msg = WireBuffer::new();
        msg.write_u8(MSG_FRAMEBUFFER_UPDATE_REQUEST);
        msg.write_u8(1); // Incremental
        msg.write_u16(0); // x position
        msg.write_u16(0); // y position
        msg.write_u16(width);
        msg.write_u16(height);
        msg
    }

    pub fn create_key_event(&self, key: X11KeyCode, action: KeyAction) -> WireBuffer {
        let mut msg = WireBuffer::new();
        msg.write_u8(MSG_KEY_EVENT);
        msg.write_u8(action as u8);
        msg.write_u16(0);
        msg.write_u32(key);
        msg
    }

    /// RFB-TV 2.0 only; returns an empty message under 1.3 that won't
    /// disrupt the protocol.
    pub fn create_key_time_event(
        &self,
        key: X11KeyCode,
        action: KeyAction,
        timestamp: &str,
    ) -> WireBuffer {
        let mut msg = WireBuffer::new();
        if self.version == ProtocolVersion::V1_3 {
            warn!("KeyTimeEvent not supported in RFB-TV 1.3");
            return msg;
        }
        msg.write_u8(MSG_KEY_TIME_EVENT);
        msg.write_u8(action as u8);
        msg.write_u32(key);
        msg.write_string(timestamp);
        msg
    }

    pub fn create_pointer_event(&self, button_mask: u8, x: u16, y: u16) -> WireBuffer {
        let mut msg = WireBuffer::new();
        msg.write_u8(MSG_POINTER_EVENT);
        msg.write_u8(button_mask);
        msg.write_u16(x);
        msg.write_u16(y);
        msg
    }

    pub fn create_session_terminate_indication(&self, reason: TerminateReason) -> WireBuffer {
        let mut msg = WireBuffer::new();
        msg.write_u8(MSG_SESSION_TERMINATE_INDICATION);
        msg.write_u8(reason as u8);
        msg
    }

    /// SessionSetup carries the client id as a leading string in 2.0 and as
    /// a `clientid` key-value pair in 1.3. The pair count is patched after
    /// the optional entries are appended.
    pub fn create_session_setup(
        &self,
        client_id: &str,
        params: &BTreeMap<String, String>,
        session_id: &str,
        cookie: &str,
    ) -> WireBuffer {
        let mut msg = WireBuffer::new();
        msg.write_u8(MSG_SESSION_SETUP);

        if self.version == ProtocolVersion::V2_0 {
            msg.write_string(client_id);
        }

        let count_position = msg.len();
        msg.write_key_value_pairs(params);
        let mut count = params.len();

        if self.version == ProtocolVersion::V1_3 {
            msg.write_key_value_pair("clientid", client_id);
            count += 1;
        }
        if !session_id.is_empty() {
            msg.write_key_value_pair("session_id", session_id);
            count += 1;
        }
        if !cookie.is_empty() {
            msg.write_key_value_pair("cookie", cookie);
            count += 1;
        }

        msg.patch_u8(count_position, count as u8);
        msg
    }

    pub fn create_stream_setup_response(
        &self,
        code: StreamSetupResponseCode,
        parameters: &BTreeMap<String, String>,
        local_udp_url: &str,
    ) -> WireBuffer {
        let mut msg = WireBuffer::new();
        msg.write_u8(MSG_STREAM_SETUP_RESPONSE);
        msg.write_u8(code.to_wire(self.version));
        if self.version == ProtocolVersion::V2_0 {
            msg.write_key_value_pairs(parameters);
        } else {
            msg.write_string(local_udp_url);
        }
        msg
    }

    pub fn create_stream_confirm(&self, code: StreamConfirmCode) -> WireBuffer {
        let mut msg = WireBuffer::new();
        msg.write_u8(MSG_STREAM_CONFIRM);
        msg.write_u8(code.to_wire(self.version));
        msg
    }

    pub fn create_pong(&self) -> WireBuffer {
        let mut msg = WireBuffer::new();
        msg.write_u8(MSG_PONG);
        msg
    }

    pub fn create_passthrough(&self, protocol_id: &str, data: &[u8]) -> WireBuffer {
        let mut msg = WireBuffer::new();
        msg.write_u8(MSG_PASS_THROUGH);
        msg.write_string(protocol_id);
        msg.write_blob(data);
        msg
    }

    /// RFB-TV 2.0 only.
    pub fn create_session_update(&self, changed_params: &BTreeMap<String, String>) -> WireBuffer {
        let mut msg = WireBuffer::new();
        if self.version == ProtocolVersion::V1_3 {
            warn!("SessionUpdate not supported in RFB-TV 1.3");
            return msg;
        }
        msg.write_u8(MSG_SESSION_UPDATE);
        msg.write_key_value_pairs(changed_params);
        msg
    }

    /// RFB-TV 2.0 only. The error string is only relevant for PlayerError.
    pub fn create_handoff_result(
        &self,
        result: HandoffResult,
        player_specific_error: &str,
    ) -> WireBuffer {
        let mut msg = WireBuffer::new();
        if self.version == ProtocolVersion::V1_3 {
            warn!("HandoffResult not supported in RFB-TV 1.3");
            return msg;
        }
        msg.write_u8(MSG_HANDOFF_RESULT);
        msg.write_u8(result.to_wire());
        msg.write_string(if result == HandoffResult::PlayerError {
            player_specific_error
        } else {
            ""
        });
        msg
    }

    /// RFB-TV 2.0 only.
    pub fn create_cdm_setup_response(
        &self,
        cdm_session_id: &str,
        result: CdmSetupResponseResult,
        response_fields: &BTreeMap<String, String>,
    ) -> WireBuffer {
        let mut msg = WireBuffer::new();
        if self.version == ProtocolVersion::V1_3 {
            warn!("CdmSetupResponse not supported in RFB-TV 1.3");
            return msg;
        }
        msg.write_u8(MSG_CDM_SETUP_RESPONSE);
        msg.write_string(cdm_session_id);
        msg.write_u8(result as u8);
        msg.write_key_value_pairs(response_fields);
        msg
    }

    /// RFB-TV 2.0 only.
    pub fn create_cdm_terminate_indication(
        &self,
        cdm_session_id: &str,
        reason: CdmTerminateReason,
        data: &BTreeMap<String, String>,
    ) -> WireBuffer {
        let mut msg = WireBuffer::new();
        if self.version == ProtocolVersion::V1_3 {
            warn!("CdmTerminateIndication not supported in RFB-TV 1.3");
            return msg;
        }
        msg.write_u8(MSG_CDM_TERMINATE_INDICATION);
        msg.write_string(cdm_session_id);
        msg.write_u8(reason as u8);
        msg.write_key_value_pairs(data);
        msg
    }

    /// Playback report as RFB-TV 2.0 key-value fields. The 1.3 layout is
    /// not supported (no 1.3 server ever implemented it) and yields an
    /// empty message.
    pub fn create_playback_client_report(&self, report: &PlaybackReport) -> WireBuffer {
        let mut msg = WireBuffer::new();
        if self.version == ProtocolVersion::V1_3 {
            warn!("ClientReport(playback) not supported in RFB-TV 1.3");
            return msg;
        }

        msg.write_u8(MSG_CLIENT_REPORT);
        msg.write_string("playback");

        let mut fields = BTreeMap::new();
        if let Some(state) = report.playback_state {
            fields.insert("playstate".to_string(), state.as_str().to_string());
        }
        if let Some(ms) = report.stalled_duration_ms {
            fields.insert("duration_stalled".to_string(), ms.to_string());
        }
        if let Some(pts) = report.current_pts {
            fields.insert("current_pts".to_string(), pts.to_string());
        }
        if let Some(delay) = report.pcr_delay {
            fields.insert("delay".to_string(), delay.to_string());
        }
        if let Some(bandwidth) = report.bandwidth {
            fields.insert("bandwidth".to_string(), bandwidth.to_string());
        }
        let histograms = report.format_histograms();
        if !histograms.is_empty() {
            fields.insert("histograms".to_string(), histograms);
        }

        msg.write_key_value_pairs(&fields);
        msg
    }

    /// Latency report: always exactly 3 pairs of comma-separated columns.
    pub fn create_latency_client_report(&self, report: &LatencyReport) -> WireBuffer {
        let mut subtypes = String::new();
        let mut labels = String::new();
        let mut data = String::new();
        for (i, entry) in report.entries().iter().enumerate() {
            if i > 0 {
                subtypes.push(',');
                labels.push(',');
                data.push(',');
            }
            subtypes.push_str(entry.subtype.as_str());
            labels.push_str(&entry.label);
            data.push_str(&entry.data.to_string());
        }

        let mut msg = WireBuffer::new();
        msg.write_u8(MSG_CLIENT_REPORT);
        msg.write_string("latency");
        msg.write_u8(3);
        msg.write_key_value_pair("subtypes", &subtypes);
        msg.write_key_value_pair("labels", &labels);
        msg.write_key_value_pair("data", &data);
        msg
    }

    /// Log report: 2 pairs, level and accumulated text.
    pub fn create_log_client_report(&self, report: &LogReport) -> WireBuffer {
        let mut msg = WireBuffer::new();
        msg.write_u8(MSG_CLIENT_REPORT);
        msg.write_string("log");
        msg.write_u8(2);
        msg.write_key_value_pair("level", report.max_level().as_str());
        msg.write_key_value_pair("text", report.text());
        msg
    }

    //
    // Decoder
    //

    /// Parse one server message from the buffer. On `NeedMoreData` the
    /// caller must rewind the buffer and retry with more bytes.
    pub fn parse_message(&self, message: &mut WireBuffer) -> Result<ServerMessage, CodecError> {
        let message_type = message.read_u8();
        if message.has_underflow() {
            return Err(CodecError::NeedMoreData);
        }

        let is_v2 = self.version == ProtocolVersion::V2_0;
        match message_type {
            MSG_FRAMEBUFFER_UPDATE => self.parse_frame_buffer_update(message),
            MSG_SESSION_SETUP_RESPONSE => self.parse_session_setup_response(message),
            MSG_SESSION_TERMINATE_REQUEST => self.parse_session_terminate_request(message),
            MSG_PING => Ok(ServerMessage::Ping),
            MSG_STREAM_SETUP_REQUEST => self.parse_stream_setup_request(message),
            MSG_SERVER_PASS_THROUGH => self.parse_passthrough(message),
            MSG_SERVER_COMMAND if is_v2 => self.parse_server_command(message),
            MSG_HANDOFF_REQUEST if is_v2 => self.parse_handoff_request(message),
            MSG_CDM_SETUP_REQUEST if is_v2 => self.parse_cdm_setup_request(message),
            MSG_CDM_TERMINATE_REQUEST if is_v2 => self.parse_cdm_terminate_request(message),
            other => {
                warn!("Stream parse error, unknown message type {}", other);
                Err(CodecError::ParsingMessage)
            }
        }
    }

    fn parse_rectangle(&self, msg: &mut WireBuffer) -> Result<Rectangle, CodecError> {
        let x = msg.read_u16();
        let y = msg.read_u16();
        let w = msg.read_u16();
        let h = msg.read_u16();
        let encoding = msg.read_u32();
        if msg.has_underflow() {
            return Err(CodecError::NeedMoreData);
        }

        let alpha;
        let content = match encoding {
            ENCODING_PICTURE_OBJECT => {
                alpha = msg.read_u8();
                RectangleContent::Picture(msg.read_blob())
            }
            ENCODING_URL => {
                alpha = msg.read_u8();
                RectangleContent::Url(msg.read_string())
            }
            other => {
                // Unknown encoding: we can't tell how many bytes it covers
                warn!("Framebuffer has unexpected encoding type {}", other);
                return Err(CodecError::ParsingMessage);
            }
        };
        if msg.has_underflow() {
            return Err(CodecError::NeedMoreData);
        }

        Ok(Rectangle {
            x,
            y,
            w,
            h,
            alpha,
            content,
        })
    }

    fn parse_frame_buffer_update(&self, msg: &mut WireBuffer) -> Result<ServerMessage, CodecError> {
        let bitmap = msg.read_u8();
        let nr_of_rects = msg.read_u16();
        if msg.has_underflow() {
            return Err(CodecError::NeedMoreData);
        }

        let mut rectangles = Vec::with_capacity(nr_of_rects as usize);
        for _ in 0..nr_of_rects {
            rectangles.push(self.parse_rectangle(msg)?);
        }

        Ok(ServerMessage::FramebufferUpdate {
            rectangles,
            clear: bitmap & RECT_CLEAR_BIT != 0,
            commit: bitmap & RECT_FLIP_BIT != 0,
        })
    }

    fn parse_session_setup_response(
        &self,
        msg: &mut WireBuffer,
    ) -> Result<ServerMessage, CodecError> {
        let result = msg.read_u8();

        // 1.3 stores the session id as a u32, 2.0 as a string
        let session_id = if self.version == ProtocolVersion::V2_0 {
            msg.read_string()
        } else {
            msg.read_u32().to_string()
        };
        let redirect_url = msg.read_string();
        let cookie = msg.read_string();
        if msg.has_underflow() {
            return Err(CodecError::NeedMoreData);
        }

        debug!(
            "SessionSetupResponse result:{} session_id:{} redirect:{}",
            result, session_id, redirect_url
        );

        Ok(ServerMessage::SessionSetupResponse {
            result: SessionSetupResult::from_wire(result),
            session_id,
            redirect_url,
            cookie,
        })
    }

    fn parse_session_terminate_request(
        &self,
        msg: &mut WireBuffer,
    ) -> Result<ServerMessage, CodecError> {
        let reason = msg.read_u8();
        if msg.has_underflow() {
            return Err(CodecError::NeedMoreData);
        }
        Ok(ServerMessage::SessionTerminateRequest {
            reason: SessionTerminateReason::from_wire(reason),
        })
    }

    fn parse_stream_setup_request(
        &self,
        msg: &mut WireBuffer,
    ) -> Result<ServerMessage, CodecError> {
        let uri;
        let mut params = BTreeMap::new();
        if self.version == ProtocolVersion::V2_0 {
            uri = msg.read_string();
            params = msg.read_key_value_pairs();
        } else {
            // 1.3 uses fixed fields; map them onto the 2.0 parameter names
            params.insert("video_width".to_string(), msg.read_u16().to_string());
            params.insert("video_height".to_string(), msg.read_u16().to_string());
            match msg.read_u8() {
                0 => {
                    params.insert("audio_codec".to_string(), "mpa".to_string());
                }
                1 => {
                    params.insert("audio_codec".to_string(), "aac".to_string());
                }
                2 => {
                    params.insert("audio_codec".to_string(), "ac3".to_string());
                }
                _ => {}
            }
            match msg.read_u8() {
                0 => {
                    params.insert("video_codec".to_string(), "avc".to_string());
                }
                1 => {
                    params.insert("video_codec".to_string(), "mpeg2".to_string());
                }
                _ => {}
            }
            uri = msg.read_string();
        }
        if msg.has_underflow() {
            return Err(CodecError::NeedMoreData);
        }
        Ok(ServerMessage::StreamSetupRequest { uri, params })
    }

    fn parse_passthrough(&self, msg: &mut WireBuffer) -> Result<ServerMessage, CodecError> {
        let protocol_id = msg.read_string();
        let data = msg.read_blob();
        if msg.has_underflow() {
            return Err(CodecError::NeedMoreData);
        }
        Ok(ServerMessage::PassThrough { protocol_id, data })
    }

    fn parse_server_command(&self, msg: &mut WireBuffer) -> Result<ServerMessage, CodecError> {
        let command = msg.read_string();
        let pairs = msg.read_key_value_pairs();
        if msg.has_underflow() {
            return Err(CodecError::NeedMoreData);
        }

        let get = |key: &str| pairs.get(key).cloned().unwrap_or_default();

        let parsed = match command.as_str() {
            "keyfilter_control" => ServerCommand::KeyFilterControl {
                local_keys: get("localkeys"),
                remote_keys: get("remotekeys"),
            },
            "playback_control" => ServerCommand::PlaybackControl {
                mode: parse_report_mode(&command, &get("report_mode"), false),
                interval_ms: get("interval").parse().unwrap_or(0),
            },
            "latency_control" => {
                let measurement_mode = get("measurement_mode");
                let mode = if measurement_mode.is_empty() {
                    // Empty measurement mode disables reporting, see the RFB-TV spec
                    ReportMode::Disabled
                } else {
                    parse_report_mode(&command, &get("report_mode"), false)
                };
                ServerCommand::LatencyControl {
                    mode,
                    is_duration: measurement_mode.contains("duration"),
                    is_event: measurement_mode.contains("event"),
                }
            }
            "log_control" => ServerCommand::LogControl {
                mode: parse_report_mode(&command, &get("report_mode"), true),
                min_level: parse_log_level(&get("log_level")),
            },
            "video_control" => {
                let mode = get("mode");
                ServerCommand::VideoControl {
                    mode: match mode.as_str() {
                        "gui-optimized" => VideoMode::GuiOptimized,
                        "motion-optimized" => VideoMode::VideoOptimized,
                        "" => VideoMode::NoChange,
                        other => {
                            warn!("mode not recognized: {}", other);
                            VideoMode::NoChange
                        }
                    },
                }
            }
            "underrun_mitigation_control" => {
                ServerCommand::UnderrunMitigationControl { params: pairs }
            }
            other => {
                warn!("Unrecognized server command: {}", other);
                ServerCommand::Unknown {
                    command: other.to_string(),
                }
            }
        };

        Ok(ServerMessage::ServerCommand(parsed))
    }

    fn parse_handoff_request(&self, msg: &mut WireBuffer) -> Result<ServerMessage, CodecError> {
        let suspend = msg.read_u8();
        let uri = msg.read_string();
        if msg.has_underflow() {
            return Err(CodecError::NeedMoreData);
        }
        Ok(ServerMessage::HandoffRequest {
            uri,
            resume_session_when_done: suspend != 0,
        })
    }

    fn parse_cdm_setup_request(&self, msg: &mut WireBuffer) -> Result<ServerMessage, CodecError> {
        let cdm_session_id = msg.read_string();
        let drm_type = msg.read_string();
        let session_type = msg.read_string();
        let init_data = msg.read_key_value_pairs();
        if msg.has_underflow() {
            return Err(CodecError::NeedMoreData);
        }
        Ok(ServerMessage::CdmSetupRequest {
            cdm_session_id,
            drm_system_id: parse_guid(&drm_type),
            session_type,
            init_data,
        })
    }

    fn parse_cdm_terminate_request(
        &self,
        msg: &mut WireBuffer,
    ) -> Result<ServerMessage, CodecError> {
        let cdm_session_id = msg.read_string();
        let reason = msg.read_u8();
        if msg.has_underflow() {
            return Err(CodecError::NeedMoreData);
        }
        Ok(ServerMessage::CdmTerminateRequest {
            cdm_session_id,
            reason: if reason == 0 {
                CdmTerminateReason::UserStop
            } else {
                CdmTerminateReason::Other
            },
        })
    }
}

/// Accepts exactly `RFB-TV NNN.NNN\n`.
fn is_rfbtv_version_format(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == VERSION_STRING_SIZE
        && bytes.starts_with(b"RFB-TV ")
        && bytes[7..10].iter().all(u8::is_ascii_digit)
        && bytes[10] == b'.'
        && bytes[11..14].iter().all(u8::is_ascii_digit)
        && bytes[14] == b'\n'
}

fn parse_report_mode(command: &str, mode: &str, accepts_accumulate: bool) -> ReportMode {
    match mode {
        "oneshot" => ReportMode::OneShot,
        "automatic" => ReportMode::Automatic,
        "disabled" => ReportMode::Disabled,
        "accumulate" if accepts_accumulate => ReportMode::Accumulate,
        "" => ReportMode::NoChange,
        other => {
            warn!("Unknown report_mode in server command {}: {}", command, other);
            ReportMode::NoChange
        }
    }
}

/// Any unrecognized non-empty level string maps to Debug.
fn parse_log_level(level: &str) -> Option<LogLevel> {
    match level {
        "error" => Some(LogLevel::Error),
        "warning" => Some(LogLevel::Warning),
        "info" => Some(LogLevel::Info),
        "debug" => Some(LogLevel::Debug),
        "" => None,
        _ => Some(LogLevel::Debug),
    }
}

/// GUID-formatted string (8-4-4-4-12 hex digits) to 16 bytes; malformed
/// input yields zeroes for the unparsable positions.
fn parse_guid(s: &str) -> [u8; 16] {
    let mut id = [0u8; 16];
    let mut nibbles = s.chars().filter_map(|c| c.to_digit(16));
    for byte in id.iter_mut() {
        let high = match nibbles.next() {
            Some(n) => n,
            None => break,
        };
        let low = nibbles.next().unwrap_or(0);
        *byte = ((high << 4) | low) as u8;
    }
    id
}
