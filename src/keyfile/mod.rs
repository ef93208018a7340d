//! Key files
//!
//! A key file is the user-held capability to reconstruct one stored file: its
//! id, name, size and obfuscation secret, optionally with the chunk locations.
//! The encoding carries its own version tag and an integrity trailer.

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{KEY_FILE_MAGIC, LATEST_VERSION};
pub use error::{KeyFileError, KeyFileResult};
pub use types::{ChunkHint, KeyFile};
