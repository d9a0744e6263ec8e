//! Small shared helpers for the media pipeline.

pub mod bits;
