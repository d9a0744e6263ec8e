//! Pluggable DRM back-ends.
//!
//! The server sets up CDM sessions over RFB-TV; concrete engines are
//! supplied by the embedder. The core only routes: factories are looked up
//! by their 16-byte DRM system id, sessions live in an arena keyed by the
//! server's CDM session id, and async setup/terminate results re-enter the
//! session kernel as events carrying that id.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Outcome of an asynchronous CDM session setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdmSetupResult {
    Ok,
    DrmSystemError,
    NoLicenseServer,
    LicenseNotFound,
    UnspecifiedError,
}

/// Stream decryption engine fed from the RAMS interpreter.
///
/// Encrypted payload bytes go in through `stream_data`; decrypted bytes
/// come back in order through `take_decrypted`, possibly later than the
/// call that supplied them.
pub trait StreamDecrypt: Send {
    fn set_key_identifier(&mut self, key_id: &[u8; 16]);
    fn set_initialization_vector(&mut self, iv: &[u8; 16]);
    /// Feed encrypted bytes; false means the engine rejected them and the
    /// caller must resynchronize.
    fn stream_data(&mut self, data: &[u8]) -> bool;
    /// Drain decrypted bytes that became available, in feed order.
    fn take_decrypted(&mut self) -> Vec<u8>;
}

/// Decrypt engine handle shared between a CDM session and the pipeline.
pub type SharedStreamDecrypt = Arc<Mutex<dyn StreamDecrypt>>;

/// Completion callback for `CdmSession::setup`.
pub type CdmSetupReply = Box<dyn FnOnce(CdmSetupResult, BTreeMap<String, String>) + Send>;

/// Completion callback for `CdmSession::terminate`.
pub type CdmTerminateReply = Box<dyn FnOnce(BTreeMap<String, String>) + Send>;

/// One CDM session created by a factory.
pub trait CdmSession: Send {
    /// Start license acquisition; the reply may fire from any thread.
    fn setup(
        &mut self,
        session_type: &str,
        init_data: &BTreeMap<String, String>,
        reply: CdmSetupReply,
    );

    /// Tear the session down; the reply may fire from any thread.
    fn terminate(&mut self, reply: CdmTerminateReply);

    /// The decrypt engine of this session, once usable.
    fn stream_decrypt_engine(&self) -> Option<SharedStreamDecrypt>;
}

/// Factory for one DRM system, registered by the embedder.
pub trait CdmSessionFactory: Send {
    fn drm_system_id(&self) -> [u8; 16];
    fn create(&self) -> Option<Box<dyn CdmSession>>;
}
