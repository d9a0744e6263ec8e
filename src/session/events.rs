//! The session event queue.
//!
//! All session-state mutation is linearized through one FIFO of tagged
//! events consumed by the kernel thread. Producers are the embedder, the
//! network receive thread, the timer engine and DRM callbacks.

use super::state::ClientErrorCode;
use crate::drm::CdmSetupResult;
use crate::media::PlayerEvent;
use crate::protocol::messages::CdmTerminateReason;
use crate::transport::TransportError;

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};

use std::collections::BTreeMap;

/// Key and pointer action requested by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    None,
    Down,
    Up,
    DownAndUp,
    KeyInput,
}

/// Pointer buttons, mapped to the wire mask bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerButton {
    None,
    Left,
    Right,
    Middle,
    WheelUp,
    WheelDown,
}

impl PointerButton {
    pub fn mask(self) -> u8 {
        match self {
            PointerButton::None => 0,
            PointerButton::Left => 1 << 0,
            PointerButton::Middle => 1 << 1,
            PointerButton::Right => 1 << 2,
            PointerButton::WheelUp => 1 << 3,
            PointerButton::WheelDown => 1 << 4,
        }
    }
}

/// Latency measurements arriving from the media path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyDataType {
    KeyPress,
    FirstPaint,
    AppComplete,
}

/// Everything that can happen to a session, in one tagged union. Each
/// variant is dispatched to its handler by the kernel thread.
#[derive(Debug, Clone)]
pub enum Event {
    Initiate {
        host: String,
        url: String,
        screen_width: u16,
        screen_height: u16,
        optional_parameters: BTreeMap<String, String>,
        start_time_ms: u64,
    },
    Terminate {
        result_code: ClientErrorCode,
    },
    Suspend,
    Resume,
    ParameterUpdate {
        optional_parameters: BTreeMap<String, String>,
    },
    Key {
        x11_key: u32,
        action: InputAction,
    },
    Pointer {
        x: u16,
        y: u16,
        button: PointerButton,
        action: InputAction,
    },
    Player {
        event: PlayerEvent,
    },
    /// Inbound bytes; ownership of the buffer transfers with the event.
    StreamData {
        data: Bytes,
    },
    StreamError {
        result: Result<(), TransportError>,
    },
    LatencyData {
        data_type: LatencyDataType,
        pts_ms: u64,
        original_event_time_ms: u64,
    },
    Stall {
        id: String,
        is_audio: bool,
        duration_ms: u32,
    },
    Connect,
    CdmSessionTerminate {
        cdm_session_id: String,
        reason: CdmTerminateReason,
    },
    CdmSetupResult {
        cdm_session_id: String,
        result: CdmSetupResult,
        response: BTreeMap<String, String>,
    },
    CdmTerminateResult {
        cdm_session_id: String,
        stop_data: BTreeMap<String, String>,
    },
    ProtocolExtensionSend {
        protocol_id: String,
        data: Vec<u8>,
    },
    StreamTimeoutExpired,
    PlaybackReportPeriodicTrigger,
    FrameBufferUpdateRequest,
    MediaTick,
    /// Does nothing; used to wake the consumer for shutdown.
    Null,
}

/// Unbounded FIFO carrying session events to the kernel thread.
#[derive(Clone)]
pub struct EventQueue {
    sender: Sender<Event>,
}

impl EventQueue {
    pub fn new() -> (EventQueue, Receiver<Event>) {
        let (sender, receiver) = unbounded();
        (EventQueue { sender }, receiver)
    }

    /// Never blocks; events are only lost if the consumer is gone.
    pub fn put(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}
