pub mod av_sync;
pub mod config;
pub mod health;
pub mod ice_buffer;
pub mod media;
pub mod negotiation;
pub mod scheduler;
pub mod session;
pub mod signaling;
pub mod speaking;
pub mod telemetry;
pub mod tracks;

/// Participant identity within a channel.
pub type PeerId = String;
