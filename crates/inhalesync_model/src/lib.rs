//! # Inhalesync Model
//!
//! Record types shared between the sync engine, its repositories and its
//! gateway.
//!
//! This crate provides:
//! - `ChangeTracking`, the dirty flag / change time / server offset triple
//!   carried by every synced record
//! - `TrackedRecord`, the trait the engine uses to treat record types
//!   uniformly
//! - The six synced record types and their identity keys
//! - `SyncBatch`, the typed record-of-lists exchanged with the gateway
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod records;
mod tracking;

pub use batch::{BatchCounts, BatchMember, SyncBatch};
pub use records::{
    DailyFeeling, Device, FeelingLevel, InhaleEvent, InhaleEventKey, Prescription,
    PrescriptionKey, ReminderSetting, UserProfile,
};
pub use tracking::{ChangeTracking, RecordKind, TrackedRecord};
