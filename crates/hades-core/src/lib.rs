//! Process model, shared caches and enrichment used by the Hades collectors.

pub mod cache;
pub mod enrich;
pub mod identity;
pub mod pdk;
pub mod process;
pub mod record;
pub mod sender;

pub use cache::{Cache, ProcessCaches};
pub use enrich::Enricher;
pub use identity::{SystemUsers, UserLookup};
pub use process::{Process, ProcessPool, Source, Syscall};
pub use record::{DataType, Record};
pub use sender::{RecordSender, SendError};
