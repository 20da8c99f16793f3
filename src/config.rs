//! Session configuration.
//!
//! Every field has a default, so a partial document deserializes cleanly:
//!
//! ```
//! use muxwire::SessionConfig;
//!
//! let config: SessionConfig = serde_json::from_str(r#"{"window_size": 1024}"#).unwrap();
//! assert_eq!(config.window_size, 1024);
//! assert_eq!(config.accept_backlog, 128);
//! ```

use serde::Deserialize;

use crate::flow_control::DEFAULT_WINDOW_SIZE;
use crate::protocol::DEFAULT_READ_BUFFER_SIZE;
use crate::writer::WriterConfig;

/// Default number of accepted-but-unclaimed streams per queue.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 128;

/// Default number of locally reset stream ids remembered.
pub const DEFAULT_RESET_MEMORY: usize = 1024;

/// Tunables for one session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Initial send and receive window for every stream.
    pub window_size: u32,
    /// Capacity of each accept queue. A SYN arriving while its queue is full
    /// is refused with RST `REFUSED_STREAM`.
    pub accept_backlog: usize,
    /// How many locally reset stream ids to remember, so that frames the
    /// peer sent before seeing the RST are dropped without a reply.
    pub reset_memory: usize,
    /// Read chunk size of the frame reader.
    pub read_buffer_size: usize,
    pub writer: WriterConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            reset_memory: DEFAULT_RESET_MEMORY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            writer: WriterConfig::default(),
        }
    }
}
