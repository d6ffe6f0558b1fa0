//! Shards: in-memory key space, persistence queue, index and commands.

mod commands;
mod flush;
mod index;
mod queue;
mod record;
mod registry;
#[allow(clippy::module_inception)]
mod shard;
mod value;

pub use commands::{Command, KeyAccess, Reply};
pub use flush::{spawn_flush_task, FlushTask};
pub use index::Index;
pub use queue::PersistenceQueue;
pub use record::KeyRecord;
pub use registry::ShardRegistry;
pub use shard::Shard;
pub use value::StoredValue;
