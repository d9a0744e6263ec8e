//! Session state machine types and the observable projection.

use std::sync::atomic::{AtomicU8, Ordering};

/// Internal protocol state, transitioned only by the kernel thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfbtvState {
    Init,
    Initiated,
    Redirected,
    Connecting,
    Opening,
    Active,
    Suspended,
    Error,
}

impl RfbtvState {
    pub fn name(self) -> &'static str {
        match self {
            RfbtvState::Init => "INIT",
            RfbtvState::Initiated => "INITIATED",
            RfbtvState::Redirected => "REDIRECTED",
            RfbtvState::Connecting => "CONNECTING",
            RfbtvState::Opening => "OPENING",
            RfbtvState::Active => "ACTIVE",
            RfbtvState::Suspended => "SUSPENDED",
            RfbtvState::Error => "ERROR",
        }
    }
}

/// Coarse state projection exposed to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Suspended = 3,
    Error = 4,
}

impl SessionState {
    /// Fixed, total projection from the internal state.
    pub fn from_rfbtv(state: RfbtvState) -> Self {
        match state {
            RfbtvState::Init => SessionState::Disconnected,
            RfbtvState::Initiated
            | RfbtvState::Redirected
            | RfbtvState::Connecting
            | RfbtvState::Opening => SessionState::Connecting,
            RfbtvState::Active => SessionState::Connected,
            RfbtvState::Suspended => SessionState::Suspended,
            RfbtvState::Error => SessionState::Error,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Disconnected,
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Suspended,
            _ => SessionState::Error,
        }
    }
}

/// Atomically readable [`SessionState`], published on every transition.
#[derive(Debug)]
pub struct ObservableState(AtomicU8);

impl Default for ObservableState {
    fn default() -> Self {
        ObservableState(AtomicU8::new(SessionState::Disconnected as u8))
    }
}

impl ObservableState {
    pub fn load(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Client error codes published to the embedder, mirroring the numeric
/// families of the CloudTV client error code specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorCode {
    Ok,
    /// Normal stop, but the client should not tune away.
    OkAndDoNotRetune,
    /// Connection refused by the server.
    ConnectionRefused110,
    /// Protocol version mismatch or unsupported scheme.
    BadVersion115,
    /// No host / configuration error.
    NoHost120,
    /// Connect timeout.
    ConnectTimeout130,
    /// Too many redirects.
    TooManyRedirects131,
    /// Application or client id rejected.
    AppOrId140,
    /// Insufficient bandwidth.
    Bandwidth150,
    /// No server resources.
    Resources160,
    /// Latency too large.
    Latency170,
    /// Unspecified error.
    Unspecified190,
    /// Ping timeout.
    PingTimeout200,
    /// Internal server error.
    InternalServer210,
    /// Server shutting down.
    Shutdown220,
    /// Application stream setup failed.
    AppStream230,
    /// Invalid parameters.
    Params240,
}

impl ClientErrorCode {
    pub fn is_ok(self) -> bool {
        matches!(self, ClientErrorCode::Ok | ClientErrorCode::OkAndDoNotRetune)
    }
}

/// Embedder notifications on observable state changes.
pub trait SessionObserver: Send + Sync {
    fn state_changed(&self, state: SessionState, error_code: ClientErrorCode);
}
