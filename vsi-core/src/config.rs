use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/vsi/vsi.toml";
const ENV_CONFIG_PATH: &str = "VSI_CONFIG";
const ENV_SEGMENT_PATH: &str = "VSI_SEGMENT";

/// Sizing and placement parameters for the shared segment.
#[derive(Debug, Deserialize, Clone)]
pub struct VsiConfig {
    /// Backing file for the memory-mapped segment.
    #[serde(default = "default_segment_path")]
    pub segment_path: PathBuf,
    /// Total segment size in bytes: header + system area + user arena.
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,
    /// Bytes reserved for the system node pool (B-tree nodes of the
    /// allocator's own free-list trees).
    #[serde(default = "default_system_area_size")]
    pub system_area_size: u64,
    /// Longest accepted signal name, enforced at definition time.
    #[serde(default = "default_max_name_len")]
    pub max_name_len: u64,
}

impl Default for VsiConfig {
    fn default() -> Self {
        Self {
            segment_path: default_segment_path(),
            segment_size: default_segment_size(),
            system_area_size: default_system_area_size(),
            max_name_len: default_max_name_len(),
        }
    }
}

fn default_segment_path() -> PathBuf {
    PathBuf::from("/tmp/vsi.db")
}
fn default_segment_size() -> u64 {
    16 * 1024 * 1024
}
fn default_system_area_size() -> u64 {
    1024 * 1024
}
fn default_max_name_len() -> u64 {
    255
}

impl VsiConfig {
    /// Load configuration from file. The file path can be overridden with
    /// the `VSI_CONFIG` environment variable and the segment path with
    /// `VSI_SEGMENT`. A missing or unparseable file yields the defaults.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg: VsiConfig = match fs::read_to_string(PathBuf::from(path)) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => VsiConfig::default(),
        };
        if let Ok(seg) = std::env::var(ENV_SEGMENT_PATH) {
            cfg.segment_path = PathBuf::from(seg);
        }
        cfg
    }
}
