//! The RFB-TV session kernel.
//!
//! One thread consumes the session event queue; every handler runs under
//! the single session mutex and drives the codec, the connection, the
//! media pipeline, reports, timers and the registered embedder callbacks.

pub mod events;
pub mod extension;
pub mod keyfilter;
pub mod state;
pub mod timer;

pub use events::{Event, EventQueue, InputAction, LatencyDataType, PointerButton};
pub use keyfilter::{KeyFilter, KeyMap};
pub use state::{ClientErrorCode, ObservableState, RfbtvState, SessionObserver, SessionState};

use extension::{EchoProtocolExtension, ExtensionReply, HandoffHandler, ProtocolExtension};
use timer::{TimerEngine, TimerId};

use crate::drm::{CdmSession, CdmSessionFactory, CdmSetupResult};
use crate::media::{MediaPipeline, MediaPlayerFactory, PipelineError, PlayerEvent};
use crate::overlay::{ContentLoader, OverlayRenderer, OverlayWorker};
use crate::protocol::messages::*;
use crate::protocol::{CodecError, RfbtvCodec, WireBuffer};
use crate::reports::{
    LatencyReport, LatencySubtype, LogReport, PlaybackReport, PlaybackState, ReportManager,
    MEASUREMENT_MODE_DURATION, MEASUREMENT_MODE_EVENT,
};
use crate::store::{DataStore, COOKIE_FILE};
use crate::transport::{ConnectionWorker, StreamSink, TransportError};

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const DEFAULT_RFBTV_SERVER_PORT: u16 = 8095;

const MAX_RFBTV_REDIRECTS: u32 = 20;

/// Reconnect back-off table, in seconds of maximum jitter above the
/// 5-second base; exhausting it closes the session.
const RECONNECT_BACKOFF_SECONDS: [u64; 4] = [10, 20, 40, 80];

const STREAM_ERROR_TIMEOUT: Duration = Duration::from_millis(5000);
const REPORT_TRIGGER_PERIOD: Duration = Duration::from_millis(100);
const MEDIA_TICK_PERIOD: Duration = Duration::from_millis(10);

/// Session-level errors funneled into `close_session_in_case_of_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Transport(TransportError),
    Codec(CodecError),
    TooManyRedirects,
    UnsupportedProtocol,
    InvalidState,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Transport(e) => write!(f, "{}", e),
            SessionError::Codec(e) => write!(f, "{}", e),
            SessionError::TooManyRedirects => write!(f, "Too many redirects"),
            SessionError::UnsupportedProtocol => write!(f, "Unsupported protocol scheme"),
            SessionError::InvalidState => write!(f, "Call in invalid session state"),
        }
    }
}

impl Error for SessionError {}

impl From<TransportError> for SessionError {
    fn from(error: TransportError) -> Self {
        SessionError::Transport(error)
    }
}

impl From<CodecError> for SessionError {
    fn from(error: CodecError) -> Self {
        SessionError::Codec(error)
    }
}

impl SessionError {
    /// Translation to the published client error code families.
    fn error_code(&self) -> ClientErrorCode {
        match self {
            SessionError::Transport(TransportError::ConnectionRefused) => {
                ClientErrorCode::ConnectionRefused110
            }
            SessionError::Transport(TransportError::HostNotFound) => ClientErrorCode::NoHost120,
            SessionError::Transport(TransportError::ConnectTimeout) => {
                ClientErrorCode::ConnectTimeout130
            }
            SessionError::Codec(CodecError::InvalidServerVersion) => ClientErrorCode::BadVersion115,
            SessionError::UnsupportedProtocol => ClientErrorCode::BadVersion115,
            SessionError::TooManyRedirects => ClientErrorCode::TooManyRedirects131,
            _ => ClientErrorCode::Unspecified190,
        }
    }
}

/// Immutable client identity and platform wiring, injected at
/// construction instead of living in a process-wide context.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub client_manufacturer: String,
    pub client_model: String,
    pub unique_id: String,
    pub base_store_path: PathBuf,
    /// Local UDP forward URL reported in RFB-TV 1.3 stream setup responses.
    pub stream_forward_url: String,
    pub key_map: KeyMap,
    pub preferred_language: String,
}

impl SessionContext {
    /// Client identifier as specified: `<manufacturer>-<model>_<unique id>`.
    fn client_id(&self) -> String {
        format!(
            "{}-{}_{}",
            self.client_manufacturer, self.client_model, self.unique_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamConfirmSentState {
    NotSent,
    OkSent,
    ErrorSent,
}

struct CdmSessionEntry {
    session: Box<dyn CdmSession>,
    terminate_reason: CdmTerminateReason,
}

/// All mutable session state, guarded by the single session mutex.
struct SessionInner {
    context: SessionContext,
    queue: EventQueue,
    timer: Arc<TimerEngine>,
    observable: Arc<ObservableState>,
    observer: Arc<dyn SessionObserver>,
    key_filter: Arc<KeyFilter>,
    store: DataStore,
    log_capture_enabled: Arc<AtomicBool>,

    rfbtv_state: RfbtvState,
    codec: RfbtvCodec,
    rx_message: WireBuffer,
    connection: ConnectionWorker,
    pipeline: MediaPipeline,

    // Client-controlled session parameters
    session_url: String,
    screen_width: u16,
    screen_height: u16,
    param_list: BTreeMap<String, String>,

    // Dynamic session state
    session_id: String,
    button_mask: u8,
    redirect_count: u32,
    connect_attempts: usize,
    closing_suspended: bool,
    current_stream_uri: Option<String>,
    stream_confirm_sent_state: StreamConfirmSentState,
    session_start_ms: u64,
    media_clock_origin: Instant,
    stalled_timestamp: Option<Instant>,

    // Reporting
    playback_report: PlaybackReport,
    playback_report_manager: ReportManager,
    latency_report: LatencyReport,
    latency_report_manager: ReportManager,
    log_report: LogReport,
    log_report_manager: ReportManager,

    // Collaborators
    overlay_renderer: Option<Arc<dyn OverlayRenderer>>,
    content_loader: Option<Arc<dyn ContentLoader>>,
    overlay_worker: Option<OverlayWorker>,
    protocol_extensions: BTreeMap<String, Box<dyn ProtocolExtension>>,
    drm_systems: Vec<Box<dyn CdmSessionFactory>>,
    active_cdm_sessions: BTreeMap<String, CdmSessionEntry>,
    handoff_handlers: BTreeMap<String, Box<dyn HandoffHandler>>,
}

/// Back-log of log lines that could not take the session mutex.
#[derive(Default)]
struct LogState {
    backlog: Vec<(LogLevel, String)>,
    is_logging: bool,
}

/// The RFB-TV client session: public API plus the kernel thread.
pub struct Session {
    queue: EventQueue,
    inner: Arc<Mutex<SessionInner>>,
    observable: Arc<ObservableState>,
    key_filter: Arc<KeyFilter>,
    key_map: KeyMap,
    log_state: Arc<Mutex<LogState>>,
    log_capture_enabled: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    kernel_thread: Option<thread::JoinHandle<()>>,
}

/// Connection sink: forwards socket output into the event queue.
struct QueueSink(EventQueue);

impl StreamSink for QueueSink {
    fn stream_data(&self, data: Bytes) {
        self.0.put(Event::StreamData { data });
    }

    fn stream_error(&self, result: Result<(), TransportError>) {
        self.0.put(Event::StreamError { result });
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Session {
    pub fn new(context: SessionContext, observer: Arc<dyn SessionObserver>) -> Session {
        let (queue, receiver) = EventQueue::new();
        let timer = Arc::new(TimerEngine::new(queue.clone()));
        let observable = Arc::new(ObservableState::default());
        let key_filter = Arc::new(KeyFilter::new());
        let key_map = context.key_map.clone();
        let store = DataStore::new(&context.base_store_path);

        let mut pipeline = MediaPipeline::new();
        pipeline.set_preferred_language(&context.preferred_language);

        let mut protocol_extensions: BTreeMap<String, Box<dyn ProtocolExtension>> = BTreeMap::new();
        let echo: Box<dyn ProtocolExtension> = Box::<EchoProtocolExtension>::default();
        protocol_extensions.insert(echo.protocol_id().to_string(), echo);

        let log_capture_enabled = Arc::new(AtomicBool::new(false));

        let inner = Arc::new(Mutex::new(SessionInner {
            context,
            queue: queue.clone(),
            timer: timer.clone(),
            observable: observable.clone(),
            observer,
            key_filter: key_filter.clone(),
            store,
            log_capture_enabled: log_capture_enabled.clone(),
            rfbtv_state: RfbtvState::Init,
            codec: RfbtvCodec::new(),
            rx_message: WireBuffer::new(),
            connection: ConnectionWorker::new(),
            pipeline,
            session_url: String::new(),
            screen_width: 0,
            screen_height: 0,
            param_list: BTreeMap::new(),
            session_id: String::new(),
            button_mask: 0,
            redirect_count: 0,
            connect_attempts: 0,
            closing_suspended: false,
            current_stream_uri: None,
            stream_confirm_sent_state: StreamConfirmSentState::NotSent,
            session_start_ms: 0,
            media_clock_origin: Instant::now(),
            stalled_timestamp: None,
            playback_report: PlaybackReport::new(),
            playback_report_manager: ReportManager::new(),
            latency_report: LatencyReport::new(),
            latency_report_manager: ReportManager::new(),
            log_report: LogReport::new(),
            log_report_manager: ReportManager::new(),
            overlay_renderer: None,
            content_loader: None,
            overlay_worker: None,
            protocol_extensions,
            drm_systems: Vec::new(),
            active_cdm_sessions: BTreeMap::new(),
            handoff_handlers: BTreeMap::new(),
        }));

        let stop = Arc::new(AtomicBool::new(false));
        let kernel_inner = inner.clone();
        let kernel_stop = stop.clone();
        let kernel_thread = thread::Builder::new()
            .name("rfbtv-session".to_string())
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    if kernel_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    kernel_inner.lock().handle_event(event);
                }
            })
            .expect("spawn session kernel thread");

        Session {
            queue,
            inner,
            observable,
            key_filter,
            key_map,
            log_state: Arc::new(Mutex::new(LogState::default())),
            log_capture_enabled,
            stop,
            kernel_thread: Some(kernel_thread),
        }
    }

    /// Coarse session state, readable from any thread.
    pub fn state(&self) -> SessionState {
        self.observable.load()
    }

    //
    // Control interface
    //

    pub fn initiate(
        &self,
        host: &str,
        url: &str,
        screen_width: u16,
        screen_height: u16,
        optional_parameters: &BTreeMap<String, String>,
    ) {
        self.queue.put(Event::Initiate {
            host: host.to_string(),
            url: url.to_string(),
            screen_width,
            screen_height,
            optional_parameters: optional_parameters.clone(),
            start_time_ms: now_epoch_ms(),
        });
    }

    pub fn terminate(&self) {
        self.queue.put(Event::Terminate {
            result_code: ClientErrorCode::Ok,
        });
    }

    pub fn suspend(&self) {
        self.queue.put(Event::Suspend);
    }

    pub fn resume(&self) {
        self.queue.put(Event::Resume);
    }

    pub fn update_session_optional_parameters(&self, parameters: &BTreeMap<String, String>) {
        self.queue.put(Event::ParameterUpdate {
            optional_parameters: parameters.clone(),
        });
    }

    //
    // Input interface
    //

    /// Translate, filter and forward a key. Returns true when the client
    /// must handle the key code locally.
    pub fn send_keycode(&self, native_key: u32, action: InputAction) -> bool {
        let x11_key = match self.key_map.translate(native_key) {
            Some(key) => key,
            None => {
                debug!("No X11 mapping for native key {:#x}", native_key);
                native_key
            }
        };

        let (client_must_handle, server_must_handle) =
            self.key_filter.find_filter_for_key(x11_key);
        if server_must_handle {
            self.queue.put(Event::Key {
                x11_key,
                action,
            });
        }
        client_must_handle
    }

    pub fn send_pointer_event(&self, x: u16, y: u16, button: PointerButton, action: InputAction) {
        self.queue.put(Event::Pointer {
            x,
            y,
            button,
            action,
        });
    }

    //
    // Media-side callbacks
    //

    pub fn player_event(&self, event: PlayerEvent) {
        self.queue.put(Event::Player { event });
    }

    pub fn latency_stream_data(
        &self,
        data_type: LatencyDataType,
        pts_ms: u64,
        original_event_time_ms: u64,
    ) {
        self.queue.put(Event::LatencyData {
            data_type,
            pts_ms,
            original_event_time_ms,
        });
    }

    pub fn stall_detected(&self, id: &str, is_audio: bool, duration_ms: u32) {
        self.queue.put(Event::Stall {
            id: id.to_string(),
            is_audio,
            duration_ms,
        });
    }

    /// Feed a log line into the log report without re-entering the
    /// session mutex from a handler: lines that cannot take the mutex go
    /// to a back-log drained on the next successful call.
    pub fn log_message(&self, level: LogLevel, message: &str) {
        if !self.log_capture_enabled.load(Ordering::SeqCst) {
            return;
        }

        let mut log_state = self.log_state.lock();
        if log_state.is_logging {
            return; // No recursive logging
        }
        log_state.is_logging = true;

        match self.inner.try_lock() {
            Some(mut inner) => {
                let backlog = std::mem::take(&mut log_state.backlog);
                for (backlog_level, text) in backlog {
                    inner.log_report.add_log(backlog_level, &text);
                }
                inner.log_report.add_log(level, message);
                if !inner.log_report.text().is_empty()
                    && inner.log_report_manager.report_updated()
                {
                    let _ = inner.transmit_log_report();
                }
            }
            None => {
                log_state.backlog.push((level, message.to_string()));
            }
        }

        log_state.is_logging = false;
    }

    //
    // Registrations; loader/renderer only while idle
    //

    pub fn register_overlay_renderer(&self, renderer: Arc<dyn OverlayRenderer>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.is_idle() {
            debug!("Overlay renderer can only be changed when the session is idle");
            return false;
        }
        inner.overlay_renderer = Some(renderer);
        true
    }

    pub fn register_content_loader(&self, loader: Arc<dyn ContentLoader>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.is_idle() {
            debug!("Content loader can only be changed when the session is idle");
            return false;
        }
        inner.content_loader = Some(loader);
        true
    }

    pub fn register_media_player_factory(
        &self,
        scheme: &str,
        factory: Box<dyn MediaPlayerFactory>,
    ) {
        self.inner
            .lock()
            .pipeline
            .register_player_factory(scheme, factory);
    }

    pub fn register_protocol_extension(&self, extension: Box<dyn ProtocolExtension>) -> bool {
        let mut inner = self.inner.lock();
        let id = extension.protocol_id().to_string();
        if inner.protocol_extensions.contains_key(&id) {
            warn!("Protocol extension {:?} already registered", id);
            return false;
        }
        inner.protocol_extensions.insert(id, extension);
        true
    }

    pub fn unregister_protocol_extension(&self, protocol_id: &str) -> bool {
        self.inner
            .lock()
            .protocol_extensions
            .remove(protocol_id)
            .is_some()
    }

    pub fn register_drm_system(&self, factory: Box<dyn CdmSessionFactory>) -> bool {
        let mut inner = self.inner.lock();
        let id = factory.drm_system_id();
        if inner
            .drm_systems
            .iter()
            .any(|f| f.drm_system_id() == id)
        {
            warn!("DRM system already registered");
            return false;
        }
        inner.drm_systems.push(factory);
        true
    }

    pub fn unregister_drm_system(&self, drm_system_id: &[u8; 16]) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.drm_systems.len();
        inner
            .drm_systems
            .retain(|f| &f.drm_system_id() != drm_system_id);
        inner.drm_systems.len() != before
    }

    pub fn register_handoff_handler(
        &self,
        scheme: &str,
        handler: Box<dyn HandoffHandler>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.handoff_handlers.contains_key(scheme) {
            warn!("Handoff handler for {:?} already registered", scheme);
            return false;
        }
        inner.handoff_handlers.insert(scheme.to_string(), handler);
        true
    }

    pub fn unregister_handoff_handler(&self, scheme: &str) -> bool {
        self.inner.lock().handoff_handlers.remove(scheme).is_some()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.put(Event::Null);
        if let Some(thread) = self.kernel_thread.take() {
            let _ = thread.join();
        }
        self.log_capture_enabled.store(false, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.connection.close();
        if let Some(mut worker) = inner.overlay_worker.take() {
            worker.stop();
        }
    }
}

impl SessionInner {
    fn is_idle(&self) -> bool {
        matches!(self.rfbtv_state, RfbtvState::Init | RfbtvState::Error)
    }

    fn is_active(&self) -> bool {
        self.rfbtv_state == RfbtvState::Active
    }

    fn is_suspended(&self) -> bool {
        self.rfbtv_state == RfbtvState::Suspended
    }

    fn media_clock_ms(&self) -> u16 {
        self.media_clock_origin.elapsed().as_millis() as u16
    }

    fn set_state(&mut self, state: RfbtvState, error_code: ClientErrorCode) {
        debug!("state:{}->{}", self.rfbtv_state.name(), state.name());
        self.rfbtv_state = state;
        let observable = SessionState::from_rfbtv(state);
        if self.observable.load() != observable || !error_code.is_ok() {
            self.observable.store(observable);
            self.observer.state_changed(observable, error_code);
        } else {
            self.observable.store(observable);
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Initiate {
                host,
                url,
                screen_width,
                screen_height,
                optional_parameters,
                start_time_ms,
            } => self.handle_initiate(
                host,
                url,
                screen_width,
                screen_height,
                optional_parameters,
                start_time_ms,
            ),
            Event::Terminate { result_code } => self.handle_terminate(result_code),
            Event::Suspend => self.handle_suspend(),
            Event::Resume => self.handle_resume(),
            Event::ParameterUpdate {
                optional_parameters,
            } => self.handle_parameter_update(optional_parameters),
            Event::Key { x11_key, action } => self.handle_key(x11_key, action),
            Event::Pointer {
                x,
                y,
                button,
                action,
            } => self.handle_pointer(x, y, button, action),
            Event::Player { event } => self.handle_player_event(event),
            Event::StreamData { data } => self.handle_stream_data(&data),
            Event::StreamError { result } => self.handle_stream_error(result),
            Event::LatencyData {
                data_type,
                pts_ms,
                original_event_time_ms,
            } => self.handle_latency_data(data_type, pts_ms, original_event_time_ms),
            Event::Stall {
                id,
                is_audio,
                duration_ms,
            } => self.handle_stall(&id, is_audio, duration_ms),
            Event::Connect => self.handle_connect(),
            Event::CdmSessionTerminate {
                cdm_session_id,
                reason,
            } => {
                let result = self.cdm_session_terminate(&cdm_session_id, reason);
                self.close_session_in_case_of_error(result);
            }
            Event::CdmSetupResult {
                cdm_session_id,
                result,
                response,
            } => self.handle_cdm_setup_result(&cdm_session_id, result, response),
            Event::CdmTerminateResult {
                cdm_session_id,
                stop_data,
            } => self.handle_cdm_terminate_result(&cdm_session_id, stop_data),
            Event::ProtocolExtensionSend { protocol_id, data } => {
                self.handle_protocol_extension_send(&protocol_id, &data)
            }
            Event::StreamTimeoutExpired => self.handle_stream_timeout_expired(),
            Event::PlaybackReportPeriodicTrigger => self.handle_playback_report_trigger(),
            Event::FrameBufferUpdateRequest => self.handle_frame_buffer_update_request(),
            Event::MediaTick => self.handle_media_tick(),
            Event::Null => {}
        }
    }

    //
    // Message plumbing
    //

    fn send_message(&mut self, message: WireBuffer) -> Result<(), SessionError> {
        if message.is_empty() {
            return Ok(()); // Unsupported-in-this-version messages are empty
        }
        self.connection.send_data(message.data())?;
        Ok(())
    }

    fn close_session_in_case_of_error(&mut self, result: Result<(), SessionError>) {
        let error = match result {
            Ok(()) => return,
            Err(error) => error,
        };

        if self.rfbtv_state == RfbtvState::Error {
            debug!("Error ({}) reported, but already in error state", error);
            return;
        }

        info!("Error ({}), session closed and entering error state", error);
        let _ = self.session_stop(error.error_code(), TerminateReason::Normal);
    }

    fn close_connection(&mut self) {
        self.connection.close();
    }

    //
    // Lifecycle
    //

    #[allow(clippy::too_many_arguments)]
    fn handle_initiate(
        &mut self,
        host: String,
        url: String,
        screen_width: u16,
        screen_height: u16,
        optional_parameters: BTreeMap<String, String>,
        start_time_ms: u64,
    ) {
        debug!("state:{}", self.rfbtv_state.name());

        // Can only start when a session is not running
        if !self.is_idle() && self.rfbtv_state != RfbtvState::Redirected {
            debug!("Invalid state:{}", self.rfbtv_state.name());
            return;
        }

        // A redirect keeps the redirect counter
        if self.rfbtv_state != RfbtvState::Redirected {
            self.redirect_count = 0;
        }

        self.set_state(RfbtvState::Initiated, ClientErrorCode::Ok);

        self.session_url = host;
        self.screen_width = screen_width;
        self.screen_height = screen_height;
        self.param_list = optional_parameters;
        if !url.is_empty() {
            // An empty URL keeps any `url` already present in the list
            self.param_list.insert("url".to_string(), url);
        }
        self.session_start_ms = start_time_ms;

        // Initialize the session
        self.rx_message.clear();
        self.pipeline.reinitialize();
        self.codec.set_version(ProtocolVersion::Unknown);
        self.current_stream_uri = None;
        self.stream_confirm_sent_state = StreamConfirmSentState::NotSent;
        self.key_filter.clear();
        self.playback_report.reset();
        self.playback_report_manager.disable_reports();
        self.timer.cancel_timer(TimerId::PlaybackReportTick);
        self.latency_report.reset();
        self.latency_report.set_measurement_mode(0);
        self.latency_report_manager.disable_reports();
        // The log report is deliberately not reset: it may carry
        // post-mortem logs from a session that closed on an error
        self.log_report.set_min_level(LogLevel::Debug);
        self.log_report_manager.disable_reports();
        self.stalled_timestamp = None;
        self.closing_suspended = false;

        if self.overlay_worker.is_none() {
            if let Some(renderer) = &self.overlay_renderer {
                let queue = self.queue.clone();
                self.overlay_worker = Some(OverlayWorker::start(
                    renderer.clone(),
                    self.content_loader.clone(),
                    Box::new(move || queue.put(Event::FrameBufferUpdateRequest)),
                ));
            }
        }

        self.reconnect(true);
    }

    fn handle_terminate(&mut self, result_code: ClientErrorCode) {
        debug!("state:{}", self.rfbtv_state.name());

        if matches!(
            self.rfbtv_state,
            RfbtvState::Initiated | RfbtvState::Redirected | RfbtvState::Connecting
        ) {
            info!("Connection in progress, close it");
            self.close_connection();
            self.set_state(RfbtvState::Init, ClientErrorCode::Ok);
            return;
        }

        if self.is_idle() {
            debug!("Not connected");
            return;
        }

        let _ = self.session_stop(result_code, TerminateReason::Normal);
    }

    fn handle_suspend(&mut self) {
        debug!("state:{}", self.rfbtv_state.name());

        if self.is_suspended() {
            warn!("Already in suspended state");
            return;
        }

        let result = self.session_suspend();
        self.close_session_in_case_of_error(result);
    }

    fn handle_resume(&mut self) {
        debug!("state:{}", self.rfbtv_state.name());

        if !self.is_suspended() {
            warn!("Resuming a session that is not suspended, request ignored");
            return;
        }

        self.redirect_count = 0;
        self.reconnect(true);
    }

    /// Schedule a (re)connect: immediately, or after the initial 5-15 s
    /// random back-off when the server just went away.
    fn reconnect(&mut self, do_immediately: bool) {
        debug!("state:{}", self.rfbtv_state.name());

        self.connect_attempts = 0;

        if do_immediately {
            self.queue.put(Event::Connect);
        } else {
            let timeout_ms = 5000 + rand::thread_rng().gen_range(0..10000);
            self.timer.start_timer(
                TimerId::ConnectionBackoff,
                Duration::from_millis(timeout_ms),
                None,
                Event::Connect,
            );
        }

        self.set_state(RfbtvState::Connecting, ClientErrorCode::Ok);
    }

    fn handle_connect(&mut self) {
        debug!("uri:{}, state:{}", self.session_url, self.rfbtv_state.name());

        if self.rfbtv_state != RfbtvState::Connecting {
            debug!("Unexpected state:{}", self.rfbtv_state.name());
        }

        // Close any open connection, just to be sure
        self.close_connection();

        self.codec.set_version(ProtocolVersion::Unknown);
        self.button_mask = 0;

        let (scheme, rest) = match self.session_url.split_once("://") {
            Some(parts) => parts,
            None => (self.session_url.as_str(), ""),
        };

        let is_secure = match scheme {
            "rfbtv" => false,
            "rfbtvs" => true,
            other => {
                warn!(
                    "Invalid URL protocol:{}. Only the rfbtv scheme is supported",
                    other
                );
                self.close_session_in_case_of_error(Err(SessionError::UnsupportedProtocol));
                return;
            }
        };

        let authority = rest.split('/').next().unwrap_or("");
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) => match port_str.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (authority.to_string(), DEFAULT_RFBTV_SERVER_PORT),
            },
            None => (authority.to_string(), DEFAULT_RFBTV_SERVER_PORT),
        };

        let sink = Arc::new(QueueSink(self.queue.clone()));
        let result = self
            .connection
            .open(&host, port, is_secure, sink)
            .map_err(SessionError::from);
        if result.is_err() {
            self.close_session_in_case_of_error(result);
            return;
        }

        debug!("RFB-TV socket open, waiting for connect...");
    }

    fn session_stop(
        &mut self,
        error_code: ClientErrorCode,
        reason: TerminateReason,
    ) -> Result<(), SessionError> {
        debug!("state:{}", self.rfbtv_state.name());

        if self.is_idle() {
            return Ok(());
        }

        // The next session re-enables log capture if the server asks again
        self.log_capture_enabled.store(false, Ordering::SeqCst);

        self.closing_suspended = false;

        // Re-open the session first to send a terminate indication if
        // we're currently suspended
        if self.is_suspended() {
            self.closing_suspended = true;
            self.reconnect(true);
            return Ok(());
        }

        self.clean_active_cdm_sessions();

        // Suspend keeps the session id; everything else clears it
        self.session_id.clear();

        // No terminate indication while the session is still being set up
        let send_terminate = !matches!(
            self.rfbtv_state,
            RfbtvState::Connecting | RfbtvState::Opening
        );

        if error_code == ClientErrorCode::OkAndDoNotRetune {
            self.timer.cancel_timer(TimerId::StreamError);
        } else {
            // The player stop event won't reach the server once the
            // connection is gone, so account for it here first
            self.handle_player_event(PlayerEvent::Stopped);
            self.stop_streaming();
        }

        self.playback_report_manager.disable_reports();
        self.timer.cancel_timer(TimerId::PlaybackReportTick);
        self.latency_report_manager.disable_reports();
        self.log_report_manager.disable_reports();

        let result = if send_terminate {
            let message = self.codec.create_session_terminate_indication(reason);
            self.send_message(message)
        } else {
            Ok(())
        };

        self.close_connection();

        self.set_state(
            if error_code.is_ok() {
                RfbtvState::Init
            } else {
                RfbtvState::Error
            },
            error_code,
        );

        result
    }

    fn session_suspend(&mut self) -> Result<(), SessionError> {
        debug!("state:{}", self.rfbtv_state.name());

        if self.is_suspended() {
            return Ok(());
        }
        if !self.is_active() {
            debug!("Session is not running");
            return Err(SessionError::InvalidState);
        }

        let message = self
            .codec
            .create_session_terminate_indication(TerminateReason::Suspend);
        let result = self.send_message(message);

        self.stop_streaming();
        self.close_connection();

        self.set_state(RfbtvState::Suspended, ClientErrorCode::Ok);

        result
    }

    fn stop_streaming(&mut self) {
        self.pipeline.stop_stream();
        self.timer.cancel_timer(TimerId::MediaTick);
        self.stream_confirm_sent_state = StreamConfirmSentState::NotSent;
    }

    //
    // Inbound data
    //

    fn handle_stream_data(&mut self, data: &[u8]) {
        self.rx_message.write_raw(data);
        debug!(
            "Got data size:{} at bytes in buffer:{}",
            data.len(),
            self.rx_message.len()
        );

        loop {
            let result = match self.rfbtv_state {
                RfbtvState::Connecting => self.handle_version_string(),
                RfbtvState::Opening | RfbtvState::Active => {
                    let mut message = std::mem::take(&mut self.rx_message);
                    let parsed = self.codec.parse_message(&mut message);
                    self.rx_message = message;
                    match parsed {
                        Ok(message) => self.dispatch_server_message(message),
                        Err(error) => Err(SessionError::Codec(error)),
                    }
                }
                _ => {
                    warn!(
                        "Data received in state {}, ignoring it",
                        self.rfbtv_state.name()
                    );
                    self.rx_message.clear();
                    return;
                }
            };

            match result {
                Err(SessionError::Codec(CodecError::NeedMoreData)) => {
                    debug!(
                        "Message needs more data (bytes in buffer:{})",
                        self.rx_message.len()
                    );
                    self.rx_message.rewind();
                    return;
                }
                Err(error) => {
                    debug!("Message handling failed: {}", error);
                    self.rx_message.discard_bytes_read();

                    let _ = self.session_stop(
                        error.error_code(),
                        TerminateReason::ClientExecutionError,
                    );
                    return;
                }
                Ok(()) => {
                    self.rx_message.discard_bytes_read();
                    if self.rx_message.is_empty() {
                        return;
                    }
                }
            }
        }
    }

    /// First payload after connect: the server's version string. Echo our
    /// pick and send the SessionSetup.
    fn handle_version_string(&mut self) -> Result<(), SessionError> {
        let mut message = std::mem::take(&mut self.rx_message);
        let negotiated = self.codec.parse_version_string(&mut message);
        self.rx_message = message;
        let client_version = negotiated?;

        let mut echo = WireBuffer::new();
        echo.write_raw(client_version.as_bytes());
        self.send_message(echo)?;

        let client_id = self.context.client_id();
        debug!("client_id:{}", client_id);

        let cookie = String::from_utf8_lossy(&self.store.get_data(COOKIE_FILE)).into_owned();

        let setup = self.codec.create_session_setup(
            &client_id,
            &self.param_list,
            &self.session_id,
            &cookie,
        );
        self.send_message(setup)?;

        self.set_state(RfbtvState::Opening, ClientErrorCode::Ok);
        Ok(())
    }

    fn handle_stream_error(&mut self, result: Result<(), TransportError>) {
        debug!("state:{}", self.rfbtv_state.name());

        self.rx_message.clear();

        if self.is_suspended() || self.rfbtv_state == RfbtvState::Redirected {
            return;
        }

        match result {
            Ok(()) | Err(TransportError::ReadError) => {
                if self.rfbtv_state == RfbtvState::Initiated || self.is_active() {
                    info!("Connection lost in state {}, try to reconnect", self.rfbtv_state.name());
                    // Only an immediate retry when still in INITIATED
                    self.reconnect(self.rfbtv_state == RfbtvState::Initiated);
                } else {
                    let _ = self.session_stop(
                        ClientErrorCode::InternalServer210,
                        TerminateReason::Normal,
                    );
                }
            }
            Err(TransportError::ThreadShutdown) => {
                debug!("Receive stopped on purpose");
            }
            Err(error) => {
                debug!("Receive failed: {}", error);

                if self.rfbtv_state != RfbtvState::Connecting {
                    self.close_session_in_case_of_error(Err(error.into()));
                    return;
                }

                // Connecting: apply the back-off table
                let index = self.connect_attempts;
                self.connect_attempts += 1;

                if index >= RECONNECT_BACKOFF_SECONDS.len()
                    || error == TransportError::HostNotFound
                {
                    info!(
                        "Failed to reconnect after {} attempts, closing the session",
                        self.connect_attempts
                    );
                    self.close_session_in_case_of_error(Err(error.into()));
                    return;
                }

                let ceiling_ms = 1000 * RECONNECT_BACKOFF_SECONDS[index] + 1;
                let timeout_ms = 5000 + rand::thread_rng().gen_range(0..ceiling_ms);
                info!("Retry scheduled in {}ms", timeout_ms);
                self.timer.start_timer(
                    TimerId::ConnectionBackoff,
                    Duration::from_millis(timeout_ms),
                    None,
                    Event::Connect,
                );
            }
        }
    }

    //
    // Server message dispatch
    //

    fn dispatch_server_message(&mut self, message: ServerMessage) -> Result<(), SessionError> {
        match message {
            ServerMessage::FramebufferUpdate {
                rectangles,
                clear,
                commit,
            } => {
                match &self.overlay_worker {
                    Some(worker) => worker.process_images(rectangles, clear, commit),
                    None => {
                        debug!("Received a framebuffer update, but no overlay handler is installed")
                    }
                }
                Ok(())
            }
            ServerMessage::SessionSetupResponse {
                result,
                session_id,
                redirect_url,
                cookie,
            } => self.handle_session_setup_response(result, session_id, redirect_url, cookie),
            ServerMessage::SessionTerminateRequest { reason } => {
                self.handle_session_terminate_request(reason)
            }
            ServerMessage::Ping => {
                // Pong tells the server we are alive
                let pong = self.codec.create_pong();
                self.send_message(pong)
            }
            ServerMessage::StreamSetupRequest { uri, params } => {
                self.handle_stream_setup_request(&uri, params)
            }
            ServerMessage::PassThrough { protocol_id, data } => {
                self.handle_passthrough(&protocol_id, &data)
            }
            ServerMessage::ServerCommand(command) => self.handle_server_command(command),
            ServerMessage::HandoffRequest {
                uri,
                resume_session_when_done,
            } => self.handle_handoff_request(&uri, resume_session_when_done),
            ServerMessage::CdmSetupRequest {
                cdm_session_id,
                drm_system_id,
                session_type,
                init_data,
            } => self.handle_cdm_setup_request(
                &cdm_session_id,
                &drm_system_id,
                &session_type,
                &init_data,
            ),
            ServerMessage::CdmTerminateRequest { cdm_session_id, .. } => {
                self.cdm_session_terminate(&cdm_session_id, CdmTerminateReason::ServerRequest)
            }
        }
    }

    fn handle_session_setup_response(
        &mut self,
        result: SessionSetupResult,
        session_id: String,
        redirect_url: String,
        cookie: String,
    ) -> Result<(), SessionError> {
        debug!(
            "result:{:?}, session_id:{}, redirect_url:{}",
            result, session_id, redirect_url
        );

        self.session_id = session_id;

        // The cookie is rewritten on every response, even when empty
        if let Err(error) = self.store.set_data(COOKIE_FILE, cookie.as_bytes()) {
            warn!("Can't store cookie: {}", error);
        }

        if result == SessionSetupResult::Redirect {
            info!("Received redirect to {}", redirect_url);
            self.close_connection();

            if self.redirect_count >= MAX_RFBTV_REDIRECTS {
                warn!("Too many redirects");
                return Err(SessionError::TooManyRedirects);
            }

            self.redirect_count += 1;
            self.set_state(RfbtvState::Redirected, ClientErrorCode::Ok);

            // An empty url keeps the current `url` parameter intact
            self.queue.put(Event::Initiate {
                host: redirect_url,
                url: String::new(),
                screen_width: self.screen_width,
                screen_height: self.screen_height,
                optional_parameters: self.param_list.clone(),
                start_time_ms: self.session_start_ms,
            });

            return Ok(());
        }

        if result != SessionSetupResult::Ok {
            info!("Server setup error {:?}", result);

            let error_code = match result {
                SessionSetupResult::InvalidClientId | SessionSetupResult::AppNotFound => {
                    ClientErrorCode::AppOrId140
                }
                SessionSetupResult::ConfigError => ClientErrorCode::NoHost120,
                SessionSetupResult::NoResources => ClientErrorCode::Resources160,
                SessionSetupResult::InvalidParameters => ClientErrorCode::Params240,
                SessionSetupResult::InternalServerError => ClientErrorCode::InternalServer210,
                _ => ClientErrorCode::Unspecified190,
            };

            return self.session_stop(error_code, TerminateReason::Normal);
        }

        debug!("Session setup complete");
        self.set_state(RfbtvState::Active, ClientErrorCode::Ok);

        // When reconnecting only to close a suspended session, do so now
        if self.closing_suspended {
            info!("Closing suspended session");
            return self.session_stop(ClientErrorCode::Ok, TerminateReason::Normal);
        }

        let encodings = self
            .codec
            .create_set_encodings(self.content_loader.is_some());
        self.send_message(encodings)?;

        // Ready for updates even without an installed overlay handler
        let request = self
            .codec
            .create_frame_buffer_update_request(self.screen_width, self.screen_height);
        self.send_message(request)?;

        Ok(())
    }

    fn handle_session_terminate_request(
        &mut self,
        reason: SessionTerminateReason,
    ) -> Result<(), SessionError> {
        debug!("reason:{:?}", reason);

        if reason == SessionTerminateReason::Suspend {
            return self.session_suspend();
        }

        let error_code = match reason {
            SessionTerminateReason::UserStop => ClientErrorCode::Ok,
            SessionTerminateReason::InsufficientBandwidth => ClientErrorCode::Bandwidth150,
            SessionTerminateReason::LatencyTooLarge => ClientErrorCode::Latency170,
            SessionTerminateReason::DoNotRetune => ClientErrorCode::OkAndDoNotRetune,
            SessionTerminateReason::PingTimeout => ClientErrorCode::PingTimeout200,
            SessionTerminateReason::InternalServerError => ClientErrorCode::InternalServer210,
            SessionTerminateReason::ServerShuttingDown => ClientErrorCode::Shutdown220,
            SessionTerminateReason::FailedApplicationStreamSetup => ClientErrorCode::AppStream230,
            _ => ClientErrorCode::Unspecified190,
        };

        self.session_stop(error_code, TerminateReason::Normal)
    }

    fn handle_stream_setup_request(
        &mut self,
        uri: &str,
        params: BTreeMap<String, String>,
    ) -> Result<(), SessionError> {
        info!("Opening url {:?}", uri);

        // The server may be recovering from a fail-over and re-request
        // the URI we're already playing
        if self.current_stream_uri.as_deref() == Some(uri) {
            info!("Current URI already playing, request ignored");
            let response = self.codec.create_stream_setup_response(
                StreamSetupResponseCode::Success,
                &BTreeMap::new(),
                &self.context.stream_forward_url,
            );
            self.send_message(response)?;
            let confirm = self.codec.create_stream_confirm(StreamConfirmCode::Success);
            return self.send_message(confirm);
        }

        self.stop_streaming();

        // The stalled duration accumulates per stream; restart it
        self.playback_report.stalled_duration_ms = None;

        self.current_stream_uri = Some(uri.to_string());

        // An empty URL means: stop playing and blank the screen
        if uri.is_empty() {
            let response = self.codec.create_stream_setup_response(
                StreamSetupResponseCode::Success,
                &BTreeMap::new(),
                &self.context.stream_forward_url,
            );
            self.send_message(response)?;
            let confirm = self.codec.create_stream_confirm(StreamConfirmCode::Success);
            self.send_message(confirm)?;

            if let Some(renderer) = &self.overlay_renderer {
                renderer.overlay_clear(); // Specified by the protocol
            }
            return Ok(());
        }

        self.timer.start_timer(
            TimerId::MediaTick,
            MEDIA_TICK_PERIOD,
            Some(MEDIA_TICK_PERIOD),
            Event::MediaTick,
        );

        let code = match self.pipeline.start_stream(uri, &params) {
            Ok(()) => StreamSetupResponseCode::Success,
            Err(PipelineError::InvalidParameter) | Err(PipelineError::ProtocolNotRegistered) => {
                StreamSetupResponseCode::UnsupportedUri
            }
            Err(PipelineError::CannotCreateMediaPlayer) => {
                StreamSetupResponseCode::IpResourceError
            }
            Err(PipelineError::PlayerError(message)) => {
                warn!("Player refused stream: {}", message);
                StreamSetupResponseCode::ConnectionFailed
            }
        };

        let response = self.codec.create_stream_setup_response(
            code,
            &BTreeMap::new(),
            &self.context.stream_forward_url,
        );
        let result = self.send_message(response);

        if code != StreamSetupResponseCode::Success {
            self.stop_streaming();
        }

        result
    }

    fn handle_passthrough(&mut self, protocol_id: &str, data: &[u8]) -> Result<(), SessionError> {
        let mut extension = match self.protocol_extensions.remove(protocol_id) {
            Some(extension) => extension,
            None => {
                warn!("PassThrough for unregistered protocol {:?}", protocol_id);
                return Ok(());
            }
        };
        let reply = ExtensionReply::new(protocol_id, self.queue.clone());
        extension.received(data, &reply);
        self.protocol_extensions
            .insert(protocol_id.to_string(), extension);
        Ok(())
    }

    //
    // Server commands
    //

    fn handle_server_command(&mut self, command: ServerCommand) -> Result<(), SessionError> {
        match command {
            ServerCommand::KeyFilterControl {
                local_keys,
                remote_keys,
            } => {
                self.key_filter.parse_lists(&local_keys, &remote_keys);
                Ok(())
            }
            ServerCommand::PlaybackControl { mode, interval_ms } => {
                self.handle_playback_control(mode, interval_ms)
            }
            ServerCommand::LatencyControl {
                mode,
                is_duration,
                is_event,
            } => self.handle_latency_control(mode, is_duration, is_event),
            ServerCommand::LogControl { mode, min_level } => {
                self.handle_log_control(mode, min_level)
            }
            ServerCommand::VideoControl { mode } => {
                if mode != VideoMode::NoChange {
                    // The decoder mode switch belongs to the player; the
                    // core only relays it
                    info!("Video mode requested: {:?}", mode);
                }
                Ok(())
            }
            ServerCommand::UnderrunMitigationControl { params } => {
                for (key, value) in &params {
                    if key == "enabled" {
                        // The pipeline merges this into its feature set
                        let features = if value == "true" { "rams | underrun" } else { "rams" };
                        self.pipeline.set_parameter("enabled_features", features);
                    } else {
                        self.pipeline.set_parameter(key, value);
                    }
                }
                Ok(())
            }
            ServerCommand::Unknown { .. } => Ok(()),
        }
    }

    fn handle_playback_control(
        &mut self,
        mode: ReportMode,
        interval_ms: u32,
    ) -> Result<(), SessionError> {
        match mode {
            ReportMode::Disabled => {
                self.playback_report_manager.disable_reports();
                self.timer.cancel_timer(TimerId::PlaybackReportTick);
            }
            ReportMode::OneShot => {
                let _ = self.transmit_playback_report();
            }
            ReportMode::Automatic => {
                if self.playback_report_manager.enable_triggered_reports() {
                    let _ = self.transmit_playback_report();
                }
                self.playback_report_manager
                    .enable_periodic_reports(interval_ms);
                if interval_ms > 0 {
                    // Poll the report manager at a fixed rate so it can
                    // account for reports sent in between periods
                    self.timer.start_timer(
                        TimerId::PlaybackReportTick,
                        REPORT_TRIGGER_PERIOD,
                        Some(REPORT_TRIGGER_PERIOD),
                        Event::PlaybackReportPeriodicTrigger,
                    );
                } else {
                    self.timer.cancel_timer(TimerId::PlaybackReportTick);
                }
            }
            ReportMode::NoChange | ReportMode::Accumulate => {}
        }
        Ok(())
    }

    fn handle_latency_control(
        &mut self,
        mode: ReportMode,
        is_duration: bool,
        is_event: bool,
    ) -> Result<(), SessionError> {
        match mode {
            ReportMode::Disabled => self.latency_report_manager.disable_reports(),
            ReportMode::OneShot => {
                let _ = self.transmit_latency_report();
            }
            ReportMode::Automatic => {
                if self.latency_report_manager.enable_triggered_reports() {
                    let _ = self.transmit_latency_report();
                }
            }
            ReportMode::NoChange | ReportMode::Accumulate => {}
        }

        let mut measurement_mode = 0;
        if is_duration {
            measurement_mode |= MEASUREMENT_MODE_DURATION;
        }
        if is_event {
            measurement_mode |= MEASUREMENT_MODE_EVENT;
        }
        self.latency_report.set_measurement_mode(measurement_mode);
        Ok(())
    }

    fn handle_log_control(
        &mut self,
        mode: ReportMode,
        min_level: Option<LogLevel>,
    ) -> Result<(), SessionError> {
        if let Some(level) = min_level {
            self.log_report.set_min_level(level);
        }

        match mode {
            ReportMode::Disabled => {
                self.log_capture_enabled.store(false, Ordering::SeqCst);
                self.log_report_manager.disable_reports();
            }
            ReportMode::OneShot => {
                let _ = self.transmit_log_report();
            }
            ReportMode::Automatic => {
                self.log_capture_enabled.store(true, Ordering::SeqCst);
                if self.log_report_manager.enable_triggered_reports() {
                    let _ = self.transmit_log_report();
                }
            }
            ReportMode::Accumulate => {
                // Collect without transmitting
                self.log_capture_enabled.store(true, Ordering::SeqCst);
                self.log_report_manager.disable_reports();
            }
            ReportMode::NoChange => {}
        }
        Ok(())
    }

    //
    // Handoff & CDM
    //

    fn handle_handoff_request(
        &mut self,
        uri: &str,
        resume_session_when_done: bool,
    ) -> Result<(), SessionError> {
        info!("Received handoff request with uri {:?}", uri);

        let mut result = HandoffResult::UnsupportedUri;

        if let Some((scheme, arg)) = uri.split_once(':') {
            let scheme = scheme.to_string();
            match self.handoff_handlers.get_mut(&scheme) {
                Some(handler) => {
                    result = handler.handoff_request(&scheme, arg, resume_session_when_done);
                    if result == HandoffResult::Success {
                        return if resume_session_when_done {
                            // Handoff succeeded and this session suspends
                            self.session_suspend()
                        } else {
                            self.session_stop(ClientErrorCode::Ok, TerminateReason::Handoff)
                        };
                    }
                    warn!(
                        "Handoff handler for scheme {:?} returned an error",
                        scheme
                    );
                }
                None => warn!("No handoff handler registered for scheme {:?}", scheme),
            }
        } else {
            warn!("Received handoff request without scheme {:?}", uri);
        }

        let message = self.codec.create_handoff_result(result, "");
        self.send_message(message)
    }

    fn handle_cdm_setup_request(
        &mut self,
        cdm_session_id: &str,
        drm_system_id: &[u8; 16],
        session_type: &str,
        init_data: &BTreeMap<String, String>,
    ) -> Result<(), SessionError> {
        info!("Setting up CDM session with ID {:?}", cdm_session_id);

        if self.active_cdm_sessions.remove(cdm_session_id).is_some() {
            // Usually an error, but a recovering server may retry the
            // same CDM session from a different node
            warn!("CDM session {:?} already active, replacing", cdm_session_id);
            self.register_active_cdm_stream_decrypt_engine();
        }

        let factory = self
            .drm_systems
            .iter()
            .find(|factory| &factory.drm_system_id() == drm_system_id);

        let factory = match factory {
            Some(factory) => factory,
            None => {
                debug!("No registered DRM system found with the given DRM system ID");
                let message = self.codec.create_cdm_setup_response(
                    cdm_session_id,
                    CdmSetupResponseResult::DrmSystemNotInstalled,
                    &BTreeMap::new(),
                );
                return self.send_message(message);
            }
        };

        let mut session = match factory.create() {
            Some(session) => session,
            None => {
                debug!("CDM session could not be created");
                let message = self.codec.create_cdm_setup_response(
                    cdm_session_id,
                    CdmSetupResponseResult::DrmSystemError,
                    &BTreeMap::new(),
                );
                return self.send_message(message);
            }
        };

        // The result returns asynchronously as an event carrying the id
        let queue = self.queue.clone();
        let id = cdm_session_id.to_string();
        session.setup(
            session_type,
            init_data,
            Box::new(move |result, response| {
                queue.put(Event::CdmSetupResult {
                    cdm_session_id: id,
                    result,
                    response,
                });
            }),
        );

        self.active_cdm_sessions.insert(
            cdm_session_id.to_string(),
            CdmSessionEntry {
                session,
                terminate_reason: CdmTerminateReason::UserStop,
            },
        );

        Ok(())
    }

    fn handle_cdm_setup_result(
        &mut self,
        cdm_session_id: &str,
        result: CdmSetupResult,
        response: BTreeMap<String, String>,
    ) {
        let wire_result = match result {
            CdmSetupResult::Ok => CdmSetupResponseResult::Success,
            CdmSetupResult::LicenseNotFound => CdmSetupResponseResult::LicenseNotFound,
            CdmSetupResult::DrmSystemError => CdmSetupResponseResult::DrmSystemError,
            CdmSetupResult::NoLicenseServer => CdmSetupResponseResult::NoLicenseServer,
            CdmSetupResult::UnspecifiedError => CdmSetupResponseResult::UnspecifiedError,
        };

        if result == CdmSetupResult::Ok {
            self.register_active_cdm_stream_decrypt_engine();
        } else {
            self.active_cdm_sessions.remove(cdm_session_id);
        }

        let message = self
            .codec
            .create_cdm_setup_response(cdm_session_id, wire_result, &response);
        let send_result = self.send_message(message);
        self.close_session_in_case_of_error(send_result);
    }

    fn cdm_session_terminate(
        &mut self,
        cdm_session_id: &str,
        reason: CdmTerminateReason,
    ) -> Result<(), SessionError> {
        match self.active_cdm_sessions.get_mut(cdm_session_id) {
            Some(entry) => {
                entry.terminate_reason = reason;
                let queue = self.queue.clone();
                let id = cdm_session_id.to_string();
                entry.session.terminate(Box::new(move |stop_data| {
                    queue.put(Event::CdmTerminateResult {
                        cdm_session_id: id,
                        stop_data,
                    });
                }));
                Ok(())
            }
            None => {
                warn!("Terminate for unknown CDM session {:?}", cdm_session_id);
                let message = self.codec.create_cdm_terminate_indication(
                    cdm_session_id,
                    CdmTerminateReason::UnknownSession,
                    &BTreeMap::new(),
                );
                self.send_message(message)
            }
        }
    }

    fn handle_cdm_terminate_result(
        &mut self,
        cdm_session_id: &str,
        stop_data: BTreeMap<String, String>,
    ) {
        let reason = match self.active_cdm_sessions.remove(cdm_session_id) {
            Some(entry) => entry.terminate_reason,
            None => CdmTerminateReason::UnknownSession,
        };

        self.register_active_cdm_stream_decrypt_engine();

        let message =
            self.codec
                .create_cdm_terminate_indication(cdm_session_id, reason, &stop_data);
        let result = self.send_message(message);
        self.close_session_in_case_of_error(result);
    }

    /// Re-register the pipeline's decrypt engine: arbitrarily the first
    /// available among the active CDM sessions.
    fn register_active_cdm_stream_decrypt_engine(&mut self) {
        let engine = self
            .active_cdm_sessions
            .values()
            .find_map(|entry| entry.session.stream_decrypt_engine());
        self.pipeline.register_stream_decrypt_engine(engine);
    }

    fn clean_active_cdm_sessions(&mut self) {
        self.pipeline.register_stream_decrypt_engine(None);
        self.active_cdm_sessions.clear();
    }

    //
    // Input
    //

    fn handle_key(&mut self, x11_key: u32, action: InputAction) {
        debug!("state:{}", self.rfbtv_state.name());

        if !self.is_active() {
            debug!("Session is not running");
            return;
        }

        let key_action = match action {
            InputAction::None => return,
            InputAction::Down | InputAction::DownAndUp => KeyAction::Down,
            InputAction::Up => KeyAction::Up,
            InputAction::KeyInput => {
                if self.codec.version() != ProtocolVersion::V2_0 {
                    debug!("Keyinput is only available in RFB-TV version 2.0");
                    return;
                }
                KeyAction::Input
            }
        };

        let result = if self.codec.version() == ProtocolVersion::V2_0 {
            // The latency timestamp only travels while latency reporting
            // is on; down and up of one press share it
            let timestamp = if self.latency_report_manager.is_enabled() {
                now_epoch_ms().to_string()
            } else {
                String::new()
            };

            let message = self
                .codec
                .create_key_time_event(x11_key, key_action, &timestamp);
            let mut result = self.send_message(message);

            if action == InputAction::DownAndUp && result.is_ok() {
                let message =
                    self.codec
                        .create_key_time_event(x11_key, KeyAction::Up, &timestamp);
                result = self.send_message(message);
            }
            result
        } else {
            let message = self.codec.create_key_event(x11_key, key_action);
            let mut result = self.send_message(message);

            if action == InputAction::DownAndUp && result.is_ok() {
                let message = self.codec.create_key_event(x11_key, KeyAction::Up);
                result = self.send_message(message);
            }
            result
        };

        self.close_session_in_case_of_error(result);
    }

    fn handle_pointer(&mut self, x: u16, y: u16, button: PointerButton, action: InputAction) {
        debug!("state:{}", self.rfbtv_state.name());

        if !self.is_active() {
            debug!("Session is not running");
            return;
        }

        let mask = button.mask();
        match action {
            InputAction::None => {}
            InputAction::Down => self.button_mask |= mask,
            InputAction::Up => self.button_mask &= !mask,
            InputAction::DownAndUp => {
                if self.button_mask & mask == 0 {
                    // Press first, unless already down
                    let message =
                        self.codec
                            .create_pointer_event(self.button_mask | mask, x, y);
                    let _ = self.send_message(message);
                }
                self.button_mask &= !mask;
            }
            InputAction::KeyInput => {
                debug!("Keyinput is not valid as pointer event");
                return;
            }
        }

        let message = self.codec.create_pointer_event(self.button_mask, x, y);
        let result = self.send_message(message);
        self.close_session_in_case_of_error(result);
    }

    //
    // Player & reporting
    //

    fn handle_player_event(&mut self, event: PlayerEvent) {
        debug!("state:{}, event:{:?}", self.rfbtv_state.name(), event);

        let state = match event {
            PlayerEvent::Starting => PlaybackState::Starting,
            PlayerEvent::Started => {
                self.timer.cancel_timer(TimerId::StreamError);

                if self.stream_confirm_sent_state == StreamConfirmSentState::NotSent {
                    // Record the session-start-to-stream latency along
                    // with the first successful confirm
                    let elapsed = now_epoch_ms().saturating_sub(self.session_start_ms);
                    self.latency_report.add_entry(
                        LatencySubtype::SessionStartToStream,
                        "SUBTYPE_SESSION_START_TO_STREAM",
                        elapsed,
                    );
                    self.stream_confirm_sent_state = StreamConfirmSentState::OkSent;
                    let message = self.codec.create_stream_confirm(StreamConfirmCode::Success);
                    let _ = self.send_message(message);
                }
                PlaybackState::Playing
            }
            PlayerEvent::Stopped => {
                self.timer.cancel_timer(TimerId::StreamError);
                PlaybackState::Stopped
            }
            PlayerEvent::BufferUnderrun | PlayerEvent::RecoverableError => {
                // Give the player a chance to recover before reporting
                self.timer.start_timer(
                    TimerId::StreamError,
                    STREAM_ERROR_TIMEOUT,
                    None,
                    Event::StreamTimeoutExpired,
                );
                PlaybackState::Stalled
            }
            PlayerEvent::BufferOverrun
            | PlayerEvent::UnrecoverableError
            | PlayerEvent::DescrambleError
            | PlayerEvent::DecodeError
            | PlayerEvent::TransportStreamIdError
            | PlayerEvent::NetworkIdError
            | PlayerEvent::ProgramIdError
            | PlayerEvent::PhysicalError => {
                self.timer.cancel_timer(TimerId::StreamError);
                self.send_appropriate_stream_confirm_error(event);
                PlaybackState::Stalled
            }
        };

        let mut has_report_changed = self.playback_report.playback_state != Some(state);
        self.playback_report.playback_state = Some(state);

        // From here on the stalled duration is actively maintained
        if self.playback_report.stalled_duration_ms.is_none() {
            self.playback_report.stalled_duration_ms = Some(0);
        }

        match event {
            PlayerEvent::Starting => {}
            PlayerEvent::Started | PlayerEvent::Stopped => {
                if let Some(stalled_since) = self.stalled_timestamp.take() {
                    let stalled = stalled_since.elapsed().as_millis() as u32;
                    let total = self.playback_report.stalled_duration_ms.unwrap_or(0) + stalled;
                    self.playback_report.stalled_duration_ms = Some(total);
                    has_report_changed = true;
                }
            }
            _ => {
                if self.stalled_timestamp.is_none() {
                    self.stalled_timestamp = Some(Instant::now());
                }
            }
        }

        if has_report_changed && self.playback_report_manager.report_updated() {
            let _ = self.transmit_playback_report();
        }
    }

    fn send_appropriate_stream_confirm_error(&mut self, event: PlayerEvent) {
        if self.stream_confirm_sent_state == StreamConfirmSentState::ErrorSent {
            return;
        }

        let code = match event {
            PlayerEvent::BufferUnderrun
            | PlayerEvent::RecoverableError
            | PlayerEvent::DecodeError => StreamConfirmCode::DecodeError,
            PlayerEvent::DescrambleError => StreamConfirmCode::DescrambleError,
            PlayerEvent::TransportStreamIdError => StreamConfirmCode::TsidError,
            PlayerEvent::NetworkIdError => StreamConfirmCode::NidError,
            PlayerEvent::ProgramIdError => StreamConfirmCode::PidError,
            PlayerEvent::PhysicalError => StreamConfirmCode::PhysicalError,
            _ => StreamConfirmCode::UnspecifiedError,
        };

        self.stream_confirm_sent_state = StreamConfirmSentState::ErrorSent;
        let message = self.codec.create_stream_confirm(code);
        let _ = self.send_message(message);
    }

    fn handle_stream_timeout_expired(&mut self) {
        // Reached via BufferUnderrun or RecoverableError not recovering;
        // both translate to a decode error on the wire
        self.send_appropriate_stream_confirm_error(PlayerEvent::DecodeError);
    }

    fn handle_parameter_update(&mut self, parameters: BTreeMap<String, String>) {
        debug!("state:{}", self.rfbtv_state.name());

        if !self.is_active() {
            debug!("Session is not running");
            return;
        }

        // Only new or changed keys go on the wire
        let mut update_map = BTreeMap::new();
        for (key, value) in parameters {
            if self.param_list.get(&key) != Some(&value) {
                update_map.insert(key.clone(), value.clone());
            }
            self.param_list.insert(key, value);
        }

        if !update_map.is_empty() {
            let message = self.codec.create_session_update(&update_map);
            let result = self.send_message(message);
            self.close_session_in_case_of_error(result);
        }
    }

    fn handle_latency_data(
        &mut self,
        data_type: LatencyDataType,
        pts_ms: u64,
        original_event_time_ms: u64,
    ) {
        debug!("data_type:{:?}", data_type);

        match data_type {
            LatencyDataType::KeyPress => self.latency_report.add_entry(
                LatencySubtype::KeyToDisplay,
                "",
                pts_ms.saturating_sub(original_event_time_ms),
            ),
            LatencyDataType::FirstPaint => self.latency_report.add_entry(
                LatencySubtype::SessionStartToFirstPaint,
                "",
                pts_ms.saturating_sub(self.session_start_ms),
            ),
            LatencyDataType::AppComplete => self.latency_report.add_entry(
                LatencySubtype::SessionStartToComplete,
                "",
                pts_ms.saturating_sub(self.session_start_ms),
            ),
        }

        if self.latency_report_manager.report_updated() {
            let _ = self.transmit_latency_report();
        }
    }

    fn handle_stall(&mut self, id: &str, is_audio: bool, duration_ms: u32) {
        debug!("id:{}, audio={}, duration:{}", id, is_audio, duration_ms);

        // A stall sample alone never causes an unsolicited report
        self.playback_report
            .add_stalled_duration_sample(id, is_audio, duration_ms);
    }

    fn handle_playback_report_trigger(&mut self) {
        if self.playback_report_manager.timer_tick(Instant::now()) {
            let _ = self.transmit_playback_report();
        }
    }

    fn handle_frame_buffer_update_request(&mut self) {
        debug!("state:{}", self.rfbtv_state.name());

        let message = self
            .codec
            .create_frame_buffer_update_request(self.screen_width, self.screen_height);
        if self.send_message(message).is_err() {
            warn!("Unable to send frame buffer update request to server");
        }
    }

    fn handle_protocol_extension_send(&mut self, protocol_id: &str, data: &[u8]) {
        if !self.is_active() {
            debug!("Session is not running");
            return;
        }

        let message = self.codec.create_passthrough(protocol_id, data);
        let result = self.send_message(message);
        self.close_session_in_case_of_error(result);
    }

    fn handle_media_tick(&mut self) {
        let now = self.media_clock_ms();
        let stalls = self.pipeline.tick(now);
        for stall in stalls {
            self.handle_stall(
                &stall.id,
                stall.is_audio,
                stall.duration.as_millis().max(0) as u32,
            );
        }
    }

    //
    // Report transmission
    //

    fn transmit_playback_report(&mut self) -> Result<(), SessionError> {
        if !self.is_active() {
            debug!("Session is not running");
            return Err(SessionError::InvalidState);
        }

        // Merge the volatile player metrics
        let info = self.pipeline.player_info();
        if let Some(pts) = info.current_pts {
            self.playback_report.current_pts = Some(pts);
        }
        if let Some(bandwidth) = info.bandwidth {
            self.playback_report.bandwidth = Some(bandwidth);
        }

        let (current_pts, stalled_ms, pcr_delay) = self.pipeline.status();
        if let Some(pts) = current_pts {
            // The pipeline-side stream time is closest to the app, so it
            // takes precedence over the player's clock
            self.playback_report.current_pts = Some(pts);
        }
        if let Some(stalled) = stalled_ms {
            // Two independent measurements of the same thing; take the
            // larger rather than summing
            if self.playback_report.stalled_duration_ms.unwrap_or(0) < stalled {
                self.playback_report.stalled_duration_ms = Some(stalled);
            }
        }
        if let Some(delay) = pcr_delay {
            self.playback_report.pcr_delay = Some(delay);
        }

        let message = self
            .codec
            .create_playback_client_report(&self.playback_report);
        let result = self.send_message(message);

        // Volatile fields reset after each emission
        self.playback_report.current_pts = None;
        self.playback_report.pcr_delay = None;

        self.playback_report_manager.mark_transmitted(Instant::now());
        result
    }

    fn transmit_latency_report(&mut self) -> Result<(), SessionError> {
        if !self.is_active() {
            debug!("Session is not running");
            return Err(SessionError::InvalidState);
        }

        let message = self.codec.create_latency_client_report(&self.latency_report);
        let result = self.send_message(message);
        self.latency_report.reset();
        self.latency_report_manager.mark_transmitted(Instant::now());
        result
    }

    fn transmit_log_report(&mut self) -> Result<(), SessionError> {
        if !self.is_active() {
            debug!("Session is not running");
            return Err(SessionError::InvalidState);
        }

        let message = self.codec.create_log_client_report(&self.log_report);
        let result = self.send_message(message);
        self.log_report.reset();
        self.log_report_manager.mark_transmitted(Instant::now());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    /// Observer recording every state transition.
    #[derive(Default)]
    struct RecordingObserver {
        transitions: Mutex<Vec<(SessionState, ClientErrorCode)>>,
    }

    impl SessionObserver for RecordingObserver {
        fn state_changed(&self, state: SessionState, error_code: ClientErrorCode) {
            self.transitions.lock().push((state, error_code));
        }
    }

    impl RecordingObserver {
        fn wait_for(&self, wanted: SessionState, timeout: Duration) -> Option<ClientErrorCode> {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if let Some(&(_, code)) = self
                    .transitions
                    .lock()
                    .iter()
                    .find(|(state, _)| *state == wanted)
                {
                    return Some(code);
                }
                thread::sleep(Duration::from_millis(10));
            }
            None
        }
    }

    fn test_context(tag: &str) -> SessionContext {
        let mut key_table = BTreeMap::new();
        key_table.insert(0xA, 0x15);
        let mut base = std::env::temp_dir();
        base.push(format!("rfbtv-session-test-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&base);
        SessionContext {
            client_manufacturer: "acme".to_string(),
            client_model: "tv".to_string(),
            unique_id: "abc123".to_string(),
            base_store_path: base,
            stream_forward_url: String::new(),
            key_map: KeyMap::new(key_table),
            preferred_language: "eng".to_string(),
        }
    }

    /// Server-side helpers speaking real RFB-TV over the socket.
    struct TestServer {
        socket: TcpStream,
    }

    impl TestServer {
        fn send_version(&mut self, version: &[u8]) {
            self.socket.write_all(version).unwrap();
        }

        fn expect_version_echo(&mut self, expected: &[u8]) {
            let mut buf = vec![0u8; expected.len()];
            self.socket.read_exact(&mut buf).unwrap();
            assert_eq!(buf, expected);
        }

        fn read_bytes(&mut self, n: usize) -> Vec<u8> {
            let mut buf = vec![0u8; n];
            self.socket.read_exact(&mut buf).unwrap();
            buf
        }

        /// Read the client's SessionSetup and return (client_id, pairs).
        fn read_session_setup(&mut self) -> (String, BTreeMap<String, String>) {
            let mut type_byte = [0u8; 1];
            self.socket.read_exact(&mut type_byte).unwrap();
            assert_eq!(type_byte[0], 18, "expected SessionSetup");

            let client_id = self.read_string();
            let mut count = [0u8; 1];
            self.socket.read_exact(&mut count).unwrap();
            let mut pairs = BTreeMap::new();
            for _ in 0..count[0] {
                let key = self.read_string();
                let value = self.read_string();
                pairs.insert(key, value);
            }
            (client_id, pairs)
        }

        fn read_string(&mut self) -> String {
            let mut len = [0u8; 2];
            self.socket.read_exact(&mut len).unwrap();
            let len = u16::from_be_bytes(len) as usize;
            String::from_utf8(self.read_bytes(len)).unwrap()
        }

        fn send_session_setup_response(&mut self, result: u8, session_id: &str, redirect: &str, cookie: &str) {
            let mut msg = WireBuffer::new();
            msg.write_u8(16);
            msg.write_u8(result);
            msg.write_string(session_id);
            msg.write_string(redirect);
            msg.write_string(cookie);
            self.socket.write_all(msg.data()).unwrap();
        }

        /// Read SetEncodings and FramebufferUpdateRequest after setup.
        fn read_post_setup_messages(&mut self) -> (u16, u16) {
            // No content loader is registered: picture objects only
            let set_encodings = self.read_bytes(2 + 2 + 4);
            assert_eq!(set_encodings[0], 2);
            assert_eq!(u16::from_be_bytes([set_encodings[2], set_encodings[3]]), 1);
            assert_eq!(
                u32::from_be_bytes([
                    set_encodings[4],
                    set_encodings[5],
                    set_encodings[6],
                    set_encodings[7]
                ]),
                42
            );

            let fbur = self.read_bytes(10);
            assert_eq!(fbur[0], 3);
            let width = u16::from_be_bytes([fbur[6], fbur[7]]);
            let height = u16::from_be_bytes([fbur[8], fbur[9]]);
            (width, height)
        }

        fn send_ping(&mut self) {
            self.socket.write_all(&[18]).unwrap();
        }

        fn send_server_command(&mut self, command: &str, pairs: &BTreeMap<String, String>) {
            let mut msg = WireBuffer::new();
            msg.write_u8(22);
            msg.write_string(command);
            msg.write_key_value_pairs(pairs);
            self.socket.write_all(msg.data()).unwrap();
        }
    }

    /// Bring a session to Active against a loopback server.
    fn establish(
        tag: &str,
        observer: Arc<RecordingObserver>,
    ) -> (Session, TestServer) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = Session::new(test_context(tag), observer.clone());
        session.initiate(
            &format!("rfbtv://127.0.0.1:{}", port),
            "webkit:http://app",
            1280,
            720,
            &BTreeMap::new(),
        );

        let (socket, _) = listener.accept().unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut server = TestServer { socket };

        server.send_version(b"RFB-TV 002.000\n");
        server.expect_version_echo(b"RFB-TV 002.000\n");

        let (client_id, pairs) = server.read_session_setup();
        assert_eq!(client_id, "acme-tv_abc123");
        assert_eq!(pairs.get("url").map(String::as_str), Some("webkit:http://app"));

        server.send_session_setup_response(0, "S", "", "C");
        let (width, height) = server.read_post_setup_messages();
        assert_eq!((width, height), (1280, 720));

        assert_eq!(
            observer.wait_for(SessionState::Connected, Duration::from_secs(5)),
            Some(ClientErrorCode::Ok)
        );

        (session, server)
    }

    #[test]
    fn version_mismatch_errors_without_session_setup() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let observer = Arc::new(RecordingObserver::default());

        let session = Session::new(test_context("vermismatch"), observer.clone());
        session.initiate(
            &format!("rfbtv://127.0.0.1:{}", port),
            "",
            1280,
            720,
            &BTreeMap::new(),
        );

        let (mut socket, _) = listener.accept().unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        socket.write_all(b"RFB-TV 000.001\n").unwrap();

        assert_eq!(
            observer.wait_for(SessionState::Error, Duration::from_secs(5)),
            Some(ClientErrorCode::BadVersion115)
        );

        // No echo and no SessionSetup were emitted: the connection just
        // closes
        let mut buf = [0u8; 1];
        match socket.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => panic!("unexpected {} bytes from client", n),
            Err(_) => {} // Reset also acceptable
        }

        drop(session);
    }

    #[test]
    fn happy_path_v2_with_cookie_and_ping() {
        let observer = Arc::new(RecordingObserver::default());
        let (session, mut server) = establish("happy", observer.clone());

        // The cookie from the response was persisted
        let cookie_path = {
            let inner = session.inner.lock();
            inner.store.base_path().join(COOKIE_FILE)
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if std::fs::read(&cookie_path).map(|c| c == b"C").unwrap_or(false) {
                break;
            }
            assert!(Instant::now() < deadline, "cookie not stored");
            thread::sleep(Duration::from_millis(10));
        }

        // Ping -> Pong
        server.send_ping();
        assert_eq!(server.read_bytes(1), vec![21]);

        drop(session);
    }

    #[test]
    fn key_down_and_up_sends_two_key_time_events() {
        let observer = Arc::new(RecordingObserver::default());
        let (session, mut server) = establish("keys", observer.clone());

        // Enable latency reporting so the timestamp travels
        let mut pairs = BTreeMap::new();
        pairs.insert("report_mode".to_string(), "automatic".to_string());
        pairs.insert("measurement_mode".to_string(), "duration".to_string());
        server.send_server_command("latency_control", &pairs);

        // Automatic mode triggers an initial latency report
        let report_type = server.read_bytes(1);
        assert_eq!(report_type[0], 16);
        let subtype = server.read_string();
        assert_eq!(subtype, "latency");
        let mut count = [0u8; 1];
        server.socket.read_exact(&mut count).unwrap();
        for _ in 0..count[0] {
            server.read_string();
            server.read_string();
        }

        // Native 0xA translates to X11 0x15 through the key map
        assert!(!session.send_keycode(0xA, InputAction::DownAndUp));

        let down = server.read_bytes(6);
        assert_eq!(down[0], 26);
        assert_eq!(down[1], 1); // Down
        assert_eq!(u32::from_be_bytes([down[2], down[3], down[4], down[5]]), 0x15);
        let down_ts = server.read_string();
        assert!(!down_ts.is_empty());

        let up = server.read_bytes(6);
        assert_eq!(up[0], 26);
        assert_eq!(up[1], 0); // Up
        assert_eq!(u32::from_be_bytes([up[2], up[3], up[4], up[5]]), 0x15);
        let up_ts = server.read_string();
        assert_eq!(down_ts, up_ts); // Same millisecond timestamp string

        drop(session);
    }

    #[test]
    fn redirect_loop_is_capped_at_twenty() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let redirect_url = format!("rfbtv://127.0.0.1:{}", port);
        let observer = Arc::new(RecordingObserver::default());

        let session = Session::new(test_context("redirects"), observer.clone());
        session.initiate(&redirect_url, "", 640, 360, &BTreeMap::new());

        // Initial connection plus 20 redirected ones; every response
        // redirects again, and number 21 exceeds the cap
        for _ in 0..21 {
            let (socket, _) = listener.accept().unwrap();
            socket
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut server = TestServer { socket };
            server.send_version(b"RFB-TV 002.000\n");
            server.expect_version_echo(b"RFB-TV 002.000\n");
            let _ = server.read_session_setup();
            server.send_session_setup_response(1, "", &redirect_url, "");
        }

        assert_eq!(
            observer.wait_for(SessionState::Error, Duration::from_secs(10)),
            Some(ClientErrorCode::TooManyRedirects131)
        );

        drop(session);
    }

    #[test]
    fn keyfilter_control_changes_dispatch() {
        let observer = Arc::new(RecordingObserver::default());
        let (session, mut server) = establish("keyfilter", observer.clone());

        let mut pairs = BTreeMap::new();
        pairs.insert("localkeys".to_string(), "15".to_string());
        server.send_server_command("keyfilter_control", &pairs);

        // Wait until the kernel has applied the filter
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if session.key_filter.find_filter_for_key(0x15) == (true, false) {
                break;
            }
            assert!(Instant::now() < deadline, "key filter not applied");
            thread::sleep(Duration::from_millis(10));
        }

        // The key is now local-only: nothing goes on the wire
        assert!(session.send_keycode(0xA, InputAction::DownAndUp));

        drop(session);
    }

    #[test]
    fn terminate_sends_indication_and_disconnects() {
        let observer = Arc::new(RecordingObserver::default());
        let (session, mut server) = establish("terminate", observer.clone());

        session.terminate();

        let indication = server.read_bytes(2);
        assert_eq!(indication, vec![17, 0]); // Normal termination

        assert_eq!(
            observer.wait_for(SessionState::Disconnected, Duration::from_secs(5)),
            Some(ClientErrorCode::Ok)
        );

        drop(session);
    }
}
