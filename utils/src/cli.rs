use crate::protocol::DEFAULT_MESSAGE_SIZE;
use clap::{ArgAction, Args};

#[derive(Args, Debug, Clone)]
pub struct CommandLineConfig {
    /// Host
    #[arg(long, default_value_t = String::from("127.0.0.1"))]
    pub host: String,

    ///  Log level
    #[arg(long, default_value_t = String::from("info"))]
    pub log_level: String,

    /// limits the size of accepted messages, defaults to 1MiB (1 * 1024 * 1024)
    #[arg(long, default_value_t = DEFAULT_MESSAGE_SIZE)]
    pub message_size: usize,

    /// Allows node to snapshot its key range to disk on occassion
    #[arg(long, default_value_t = false, action=ArgAction::SetTrue)]
    pub enable_persistence: bool,

    /// snapshot directory
    #[arg(long, requires_if("true", "enable_persistence"))]
    pub persist_dir: Option<std::path::PathBuf>,

    /// persistence interval in milliseconds
    /// A new persistence round would be scheduled for persistence_interval into the future after
    /// current persistence round is completed
    #[arg(long, default_value_t = 1000 * 60 * 5)]
    pub persistence_interval: u64,
}

impl CommandLineConfig {
    /// Snapshot directory, when persistence is switched on and configured.
    pub fn persistence_target(&self) -> Option<&std::path::Path> {
        if self.enable_persistence {
            self.persist_dir.as_deref()
        } else {
            None
        }
    }
}

impl Default for CommandLineConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            log_level: String::from("info"),
            message_size: DEFAULT_MESSAGE_SIZE,
            enable_persistence: false,
            persist_dir: None,
            persistence_interval: 1000 * 60 * 5,
        }
    }
}
