//! Blockio Image - image lifecycle on top of the object store
//!
//! This crate drives the multi-step creation pipeline for a block image:
//! option resolution, validation, and the ordered sequence of store writes
//! that persist the image's metadata objects. Any mid-pipeline failure rolls
//! the already-written artifacts back in reverse order, so a pool only ever
//! holds complete images (plus, at worst, logged cleanup debris).
//!
//! # Pipeline
//!
//! ```text
//! resolve options ─ validate ─┐
//!                             ▼
//!   id object → directory entry → header → stripe layout → object map
//!                             │
//!            (journaling) ────┴─→ mirror mode → journal → mirror record
//!                                                          → watcher notify
//! ```
//!
//! The journal subsystem and the mirroring watcher are external; this crate
//! talks to them through the [`JournalSubsystem`] and [`MirrorNotifier`]
//! seams.

pub mod create;
pub mod journal;
pub mod mirror;
pub mod options;

pub use create::{create_image, CreateRequest};
pub use journal::{JournalCreateParams, JournalSubsystem, MemoryJournal};
pub use mirror::{BroadcastNotifier, ImageUpdateNotice, MirrorNotifier};
pub use options::{CreateParams, ImageOptions};

/// Tag owner recorded in the journal when the local cluster is the primary.
pub const LOCAL_MIRROR_UUID: &str = "";

/// Client id under which the image itself registers with its journal.
pub const IMAGE_CLIENT_ID: &str = "";

/// Requests allocation of a fresh journal tag class.
pub const TAG_CLASS_NEW: u64 = u64::MAX;
