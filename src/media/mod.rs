//! Media pipeline facade.
//!
//! Owns the RAMS splitter and the underrun mitigator, routes inbound
//! stream bytes through them to the registered media player, and exposes
//! the control points the session needs: parameter updates, decrypt-engine
//! registration, volatile playback status and the 10 ms real-time tick.

use crate::drm::SharedStreamDecrypt;
use crate::rams::{ChunkAllocator, HeapChunkAllocator, Rams};
use crate::ts::{PacketSink, PacketSinkWithMetaData, StreamMetaData};
use crate::underrun::{StallReport, UnderrunMitigator};

use log::{debug, info};

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

/// Default RAMS unit chunk size in bytes.
const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Events a media player reports back to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    Starting,
    Started,
    Stopped,
    BufferUnderrun,
    BufferOverrun,
    RecoverableError,
    UnrecoverableError,
    DescrambleError,
    DecodeError,
    TransportStreamIdError,
    NetworkIdError,
    ProgramIdError,
    PhysicalError,
}

/// Volatile player metrics pulled when a playback report goes out.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayerInfo {
    pub current_pts: Option<u64>,
    pub bandwidth: Option<u32>,
}

/// Pipeline errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The stream URI is malformed.
    InvalidParameter,
    /// No player factory is registered for the URI scheme.
    ProtocolNotRegistered,
    /// The factory failed to produce a player.
    CannotCreateMediaPlayer,
    /// The player refused the stream.
    PlayerError(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::InvalidParameter => write!(f, "Invalid stream URI"),
            PipelineError::ProtocolNotRegistered => {
                write!(f, "No media player registered for the URI scheme")
            }
            PipelineError::CannotCreateMediaPlayer => write!(f, "Cannot create media player"),
            PipelineError::PlayerError(msg) => write!(f, "Player error: {}", msg),
        }
    }
}

impl Error for PipelineError {}

/// The decoder side of the pipeline, supplied by the embedder.
pub trait MediaPlayer: Send {
    fn open(&mut self, uri: &str, params: &BTreeMap<String, String>)
        -> Result<(), PipelineError>;
    fn close(&mut self);
    /// Mitigated transport stream bytes for decoding.
    fn stream_data(&mut self, data: &[u8]);
    fn player_info(&mut self) -> PlayerInfo;
}

/// Creates media players for one URI scheme.
pub trait MediaPlayerFactory: Send {
    fn create(&self) -> Option<Box<dyn MediaPlayer>>;
}

/// Adapter dropping metadata on the floor for the underrun-bypass path.
struct PlainSink<'a>(&'a mut Vec<u8>);

impl PacketSink for PlainSink<'_> {
    fn put(&mut self, data: &[u8]) {
        self.0.extend_from_slice(data);
    }
}

impl PacketSinkWithMetaData for PlainSink<'_> {
    fn set_meta_data(&mut self, _meta: &StreamMetaData) {}
}

/// The media pipeline: RAMS in front, underrun mitigation behind, player
/// at the end. Accessed only from the session kernel thread.
pub struct MediaPipeline {
    rams: Rams,
    mitigator: UnderrunMitigator,
    underrun_enabled: bool,
    factories: BTreeMap<String, Box<dyn MediaPlayerFactory>>,
    player: Option<Box<dyn MediaPlayer>>,
}

impl Default for MediaPipeline {
    fn default() -> Self {
        MediaPipeline {
            rams: Rams::new(Box::new(HeapChunkAllocator::new(DEFAULT_CHUNK_SIZE))),
            mitigator: UnderrunMitigator::new(),
            underrun_enabled: false,
            factories: BTreeMap::new(),
            player: None,
        }
    }
}

impl MediaPipeline {
    pub fn new() -> Self {
        MediaPipeline::default()
    }

    pub fn register_player_factory(&mut self, scheme: &str, factory: Box<dyn MediaPlayerFactory>) {
        self.factories.insert(scheme.to_string(), factory);
    }

    pub fn register_chunk_allocator(&mut self, allocator: Box<dyn ChunkAllocator>) {
        self.rams.register_chunk_allocator(allocator);
    }

    pub fn register_stream_decrypt_engine(&mut self, engine: Option<SharedStreamDecrypt>) {
        self.rams
            .register_stream_decrypt_engine(engine, &mut self.mitigator);
    }

    pub fn set_preferred_language(&mut self, language: &str) {
        self.mitigator.set_preferred_language(language);
    }

    /// Fresh pipeline for a fresh session.
    pub fn reinitialize(&mut self) {
        self.stop_stream();
        self.rams.reset();
        self.mitigator.reinitialize();
        self.underrun_enabled = false;
    }

    pub fn is_streaming(&self) -> bool {
        self.player.is_some()
    }

    /// Start a player for the URI and reset the stream-side state.
    pub fn start_stream(
        &mut self,
        uri: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), PipelineError> {
        let scheme = uri
            .split_once(':')
            .map(|(scheme, _)| scheme)
            .ok_or(PipelineError::InvalidParameter)?;

        let factory = self
            .factories
            .get(scheme)
            .ok_or(PipelineError::ProtocolNotRegistered)?;
        let mut player = factory
            .create()
            .ok_or(PipelineError::CannotCreateMediaPlayer)?;

        player.open(uri, params)?;
        info!("Stream started: {}", uri);

        self.rams.reset();
        self.mitigator.reset();
        self.player = Some(player);
        Ok(())
    }

    pub fn stop_stream(&mut self) {
        if let Some(mut player) = self.player.take() {
            debug!("Stopping stream");
            player.close();
        }
    }

    /// Inbound media bytes (TS/RAMS superset).
    pub fn stream_data(&mut self, data: &[u8], now_ms: u16) {
        if self.underrun_enabled {
            self.rams.set_current_time(now_ms, &mut self.mitigator);
            self.rams.put(data, &mut self.mitigator);
        } else {
            let mut egress = Vec::new();
            {
                let mut sink = PlainSink(&mut egress);
                self.rams.set_current_time(now_ms, &mut sink);
                self.rams.put(data, &mut sink);
            }
            self.forward_to_player(&egress);
        }
    }

    /// The 10 ms real-time tick: advances the RAMS and mitigator clocks
    /// and flushes any egress to the player. Returns new stall reports.
    pub fn tick(&mut self, now_ms: u16) -> Vec<StallReport> {
        let mut egress = Vec::new();
        if self.underrun_enabled {
            self.rams.set_current_time(now_ms, &mut self.mitigator);
            self.mitigator.set_current_time(now_ms, &mut egress);
        } else {
            let mut sink = PlainSink(&mut egress);
            self.rams.set_current_time(now_ms, &mut sink);
        }
        self.forward_to_player(&egress);
        self.mitigator.take_stall_reports()
    }

    fn forward_to_player(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(player) = &mut self.player {
            player.stream_data(data);
        }
    }

    /// Apply one pipeline parameter; the feature set selects whether the
    /// underrun mitigator is in the path at all.
    pub fn set_parameter(&mut self, key: &str, value: &str) {
        if key == "enabled_features" {
            let enabled = value.contains("underrun");
            if enabled != self.underrun_enabled {
                info!("Underrun mitigation {}", if enabled { "enabled" } else { "disabled" });
                self.underrun_enabled = enabled;
            }
            return;
        }
        self.mitigator.set_parameter(key, value);
    }

    /// Volatile status for the playback report: rplayer-side current PTS,
    /// accumulated stalled duration, PCR delay.
    pub fn status(&mut self) -> (Option<u64>, Option<u32>, Option<u32>) {
        let stream_time = self.mitigator.current_stream_time();
        let current_pts = stream_time.is_valid().then(|| stream_time.as_90khz());
        let stalled = self.mitigator.stalled_duration();
        let stalled_ms = (stalled.as_millis() > 0).then(|| stalled.as_millis() as u32);
        let pcr_delay = self.mitigator.pcr_delay();
        let pcr_delay_ms = pcr_delay.is_valid().then(|| pcr_delay.as_millis() as u32);
        (current_pts, stalled_ms, pcr_delay_ms)
    }

    pub fn player_info(&mut self) -> PlayerInfo {
        match &mut self.player {
            Some(player) => player.player_info(),
            None => PlayerInfo::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct TestPlayer {
        bytes: Arc<AtomicUsize>,
    }

    impl MediaPlayer for TestPlayer {
        fn open(&mut self, _uri: &str, _params: &BTreeMap<String, String>) -> Result<(), PipelineError> {
            Ok(())
        }
        fn close(&mut self) {}
        fn stream_data(&mut self, data: &[u8]) {
            self.bytes.fetch_add(data.len(), Ordering::SeqCst);
        }
        fn player_info(&mut self) -> PlayerInfo {
            PlayerInfo {
                current_pts: Some(42),
                bandwidth: None,
            }
        }
    }

    struct TestFactory {
        bytes: Arc<AtomicUsize>,
    }

    impl MediaPlayerFactory for TestFactory {
        fn create(&self) -> Option<Box<dyn MediaPlayer>> {
            Some(Box::new(TestPlayer {
                bytes: self.bytes.clone(),
            }))
        }
    }

    #[test]
    fn start_stream_requires_registered_scheme() {
        let mut pipeline = MediaPipeline::new();
        assert_eq!(
            pipeline.start_stream("udp://239.0.0.1:1234", &BTreeMap::new()),
            Err(PipelineError::ProtocolNotRegistered)
        );
        assert_eq!(
            pipeline.start_stream("no-scheme", &BTreeMap::new()),
            Err(PipelineError::InvalidParameter)
        );

        let bytes = Arc::new(AtomicUsize::new(0));
        pipeline.register_player_factory("udp", Box::new(TestFactory { bytes }));
        assert!(pipeline
            .start_stream("udp://239.0.0.1:1234", &BTreeMap::new())
            .is_ok());
        assert!(pipeline.is_streaming());
    }

    #[test]
    fn plain_ts_reaches_player_when_underrun_disabled() {
        let bytes = Arc::new(AtomicUsize::new(0));
        let mut pipeline = MediaPipeline::new();
        pipeline.register_player_factory("udp", Box::new(TestFactory { bytes: bytes.clone() }));
        pipeline
            .start_stream("udp://x", &BTreeMap::new())
            .expect("stream");

        let mut packet = vec![0u8; 188];
        packet[0] = 0x47;
        pipeline.stream_data(&packet, 0);
        assert_eq!(bytes.load(Ordering::SeqCst), 188);
    }

    #[test]
    fn enabled_features_toggles_mitigation() {
        let mut pipeline = MediaPipeline::new();
        assert!(!pipeline.underrun_enabled);
        pipeline.set_parameter("enabled_features", "rams | underrun");
        assert!(pipeline.underrun_enabled);
        pipeline.set_parameter("enabled_features", "rams");
        assert!(!pipeline.underrun_enabled);
    }
}
