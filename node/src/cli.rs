use clap::{Args, Parser, Subcommand};
use utils::cli::CommandLineConfig;

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Starts a ring-routing node
    Chord(NodeConfig),
    /// Starts a prefix-routing node
    Pastry(NodeConfig),
}

#[derive(Args, Debug, Clone)]
pub struct NodeConfig {
    #[arg(long, default_value_t = 4411)]
    pub port: u16,
    /// host:port of a live overlay member to join through
    #[arg(long)]
    pub bootstrap: Option<String>,
    #[clap(flatten)]
    pub common: CommandLineConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 4411,
            bootstrap: None,
            common: CommandLineConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn os_select_port(mut self) -> Self {
        // allow OS to pick a port
        self.port = 0;
        self
    }

    pub fn persist_to(mut self, dir: std::path::PathBuf) -> Self {
        self.common.enable_persistence = true;
        self.common.persist_dir = Some(dir);
        self
    }

    pub fn persistence_interval(mut self, interval: u64) -> Self {
        self.common.persistence_interval = interval;
        self
    }
}
