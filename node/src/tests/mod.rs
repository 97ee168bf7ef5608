mod pastry_test;

use crate::cli::NodeConfig;
use once_cell::sync::Lazy;

pub static CONFIG: Lazy<NodeConfig> = Lazy::new(|| NodeConfig::default().os_select_port());

/// Deterministic titles for seeding a cluster.
pub fn titles(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("title-{i:03}")).collect()
}
