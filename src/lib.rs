//! rfbtv-core - RFB-TV client runtime
//!
//! The client side of the remote framebuffer television protocol: session
//! state machine and wire codec, event-serialized session kernel, RAMS
//! delta-stream interpretation and the underrun-mitigating TS pipeline.

pub mod config;
pub mod drm;
pub mod media;
pub mod overlay;
pub mod protocol;
pub mod rams;
pub mod reports;
pub mod session;
pub mod store;
pub mod transport;
pub mod ts;
pub mod underrun;
pub mod utils;

// Re-exports
pub use config::Config;
pub use protocol::{ProtocolVersion, RfbtvCodec, WireBuffer};
pub use session::{
    ClientErrorCode, InputAction, PointerButton, Session, SessionContext, SessionObserver,
    SessionState,
};
