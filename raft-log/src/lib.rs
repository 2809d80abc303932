pub mod backend;
pub mod error;
pub mod flatfile;
pub mod kv;
pub mod kv_engine;
pub mod recovery;

pub use backend::{EntryMeta, LogBackend};
pub use error::{LogError, Result};
pub use flatfile::FlatFileBackend;
pub use kv::KvBackend;
pub use kv_engine::{KvEngine, MemKvEngine, SledKvEngine};
