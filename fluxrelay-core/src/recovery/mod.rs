//! Hinted recovery
//!
//! When a replica cannot take a write, the coordinating member appends the
//! write to a local per-target log and leaves a hint `hints/<target>/<holder>`
//! in the metadata store. The holder replays the log once the target is
//! reachable and removes the hint; the target stays `recovering` until all
//! hints addressed to it are gone.

mod driver;
mod record;
mod store;

pub use driver::RecoveryDriver;
pub use record::{Record, RecordHeader};
pub use store::{RecordReader, RecoveryStore};
