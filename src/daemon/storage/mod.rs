//!  Storage is organized in two tiers.
//!   - [session_log::SessionLog] keeps completed sessions in record files, one file per UTC day
//!     the sessions ended on. Records are only ever appended.
//!   - [snapshot::SnapshotStore] keeps an overwritable copy of the running entries, used to
//!     recover them after an abnormal shutdown.

pub mod entities;
pub mod session_log;
pub mod snapshot;
