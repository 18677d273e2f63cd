//! Event reconciliation for the ZeroSum on-chain game.
//!
//! Turns the contract's log stream, delivered by polling and by push, into
//! one ordered, duplicate-free projection of each watched game, plus a
//! separately refreshed per-player stats cache.

pub mod anomaly;
pub mod config;
pub mod dedup;
pub mod events;
pub mod metrics;
pub mod projector;
pub mod scheduler;
pub mod source;
pub mod stats;
pub mod sync;

pub use sync::{CallbackGuard, GameUpdate, GameWatch, SyncError, SyncHandle, SyncSettings};
