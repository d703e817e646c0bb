//! Transcoder supervision
//!
//! The encoder subprocess is the only OS resource the streaming core owns.
//! [`command`] turns a handling profile into an argument list; [`supervisor`]
//! owns the process lifetime: spawn, stdout pump, stderr classification, and
//! the graceful-then-forceful stop contract.

pub mod command;
pub mod supervisor;

pub use command::{EncoderCommandBuilder, OutputFormat};
pub use supervisor::{EncoderEvent, EncoderExit, RunningEncoder, TranscoderSupervisor};
