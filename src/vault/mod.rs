mod sweeper;
mod types;
mod vault;

pub use sweeper::Sweeper;
pub use types::{AccountSpace, DeletedFile, RecoveredFile, SweepReport};
pub use vault::Vault;
