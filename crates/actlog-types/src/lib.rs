//! Record shapes shared by the actlog store, queue and binary.
//!
//! Everything here is plain data with serde (de)serialization. Wire names are
//! camelCase so queue lines and exported JSON match what hook scripts write.

mod hook;
mod hook_input;
mod indexed_file;
mod queue;
mod transaction;

pub use hook::*;
pub use hook_input::*;
pub use indexed_file::*;
pub use queue::*;
pub use transaction::*;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
