//! Live stream proxying
//!
//! [`stream`] is the tuner path: admission, analysis, encoder spawn, and the
//! MPEG-TS byte pump with idle timeout and deterministic teardown.
//! [`preview`] is the admin path: direct relay for playlist formats with a
//! remux fallback.

pub mod preview;
pub mod stream;
