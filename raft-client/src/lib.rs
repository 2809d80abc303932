pub mod client;
pub mod error;
pub mod rate_limit;
pub mod retry;
pub mod subapp;
pub mod table;
pub mod viability;

pub use client::{ClientConfig, RaftClient};
pub use error::{ClientError, Result};
pub use subapp::{Completion, SubApp, SubAppKey};
pub use table::SubAppTable;
