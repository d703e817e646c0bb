//! Service layer: collaborator contracts and their in-process implementations
//!
//! The streaming core reads channels, EPG facts, and configuration through
//! the traits defined here so tests can instantiate isolated cores.

pub mod channel_store;
pub mod epg;
pub mod settings;

pub use channel_store::{ChannelStore, InMemoryChannelStore};
pub use epg::{EpgService, NoopEpgService};
pub use settings::SettingsService;
