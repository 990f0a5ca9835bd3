use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::codec::CodecKind;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active compression codec for data blocks
    pub codec: CodecKind,

    /// Effort level for the higher-compression codec variant
    pub codec_level: i32,

    /// Minimum uncompressed payload size before compression is attempted
    pub compression_threshold: usize,

    /// Soft capacity of a data block in bytes; exceeding it triggers a split
    pub block_capacity: usize,

    /// Maximum serialized size of a packed collection record before it is
    /// divided into two adjacent records
    pub max_packed_value: usize,

    /// Number of striped per-logical-key locks used by the type extensions
    pub key_lock_stripes: usize,

    /// Opt-in reduced isolation for update-in-place operations.
    ///
    /// When enabled, operations flagged update-in-place run under the shared
    /// block lock (serialized among themselves by a per-block writer gate)
    /// instead of the exclusive lock. A concurrent reader of the same record
    /// can observe a torn multi-byte value. Leave disabled unless the
    /// workload is dominated by fixed-width counters and tolerates that.
    pub relaxed_in_place: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            codec: CodecKind::Lz4,
            codec_level: 3,
            compression_threshold: 100,
            block_capacity: 8 * 1024,
            max_packed_value: 512,
            key_lock_stripes: 128,
            relaxed_in_place: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.block_capacity < 512 {
            anyhow::bail!("block_capacity must be >= 512");
        }

        if self.max_packed_value < 16 {
            anyhow::bail!("max_packed_value must be >= 16");
        }

        if self.max_packed_value > self.block_capacity {
            anyhow::bail!("max_packed_value must not exceed block_capacity");
        }

        if self.key_lock_stripes == 0 {
            anyhow::bail!("key_lock_stripes must be > 0");
        }

        if self.codec == CodecKind::Zstd && !(1..=22).contains(&self.codec_level) {
            anyhow::bail!("codec_level must be in 1..=22 for zstd");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_tiny_blocks() {
        let config = Config {
            block_capacity: 64,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let dir = std::env::temp_dir().join("opaldb-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let mut config = Config::default();
        config.codec = CodecKind::Zstd;
        config.codec_level = 6;
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.codec, CodecKind::Zstd);
        assert_eq!(loaded.codec_level, 6);
    }
}
