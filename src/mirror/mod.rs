//! # Mirror Engine
//!
//! The per-image mirroring pipeline and its coordination state.

pub mod pusher;
pub mod state;

pub use pusher::{InCooldownError, Metadata, Pusher, PusherOptions, RetryError};
pub use state::{Admission, CacheEntry, PushState};
