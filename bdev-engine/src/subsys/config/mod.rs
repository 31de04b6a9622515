//! The running engine configuration. A process has exactly one; it can be
//! loaded from a YAML file at startup and sections can be adjusted
//! programmatically before the affected subsystem starts using them.

use std::{fs, io::Write, path::Path};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

pub mod opts;

use opts::{BdevOpts, NvmeBdevOpts};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Config {
    /// location of the config file, if it was loaded from one
    pub source: Option<String>,
    /// generic bdev layer options
    pub bdev_opts: BdevOpts,
    /// nvme bdev driver options
    pub nvme_bdev_opts: NvmeBdevOpts,
}

static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::default()));

impl Config {
    /// Returns a copy of the running configuration.
    pub fn get() -> Config {
        CONFIG.read().clone()
    }

    /// Applies an in-place update to the running configuration.
    pub fn update<F>(f: F)
    where
        F: FnOnce(&mut Config),
    {
        let mut cfg = CONFIG.write();
        f(&mut cfg);
        debug!("configuration updated: {:?}", *cfg);
    }

    /// Loads the configuration from a YAML file and makes it the running
    /// configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<(), String> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        let mut cfg: Config = serde_yaml::from_str(&contents)
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        cfg.source = Some(path.display().to_string());

        info!("configuration loaded from {}", path.display());
        *CONFIG.write() = cfg;
        Ok(())
    }

    /// Writes the running configuration out as YAML.
    pub fn write<P: AsRef<Path>>(path: P) -> Result<(), String> {
        let cfg = Self::get();
        let yaml = serde_yaml::to_string(&cfg)
            .map_err(|e| format!("serialization error: {}", e))?;

        let mut f = fs::File::create(path.as_ref())
            .map_err(|e| format!("{}: {}", path.as_ref().display(), e))?;
        f.write_all(yaml.as_bytes())
            .map_err(|e| format!("{}: {}", path.as_ref().display(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn yaml_round_trip() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            cfg.nvme_bdev_opts.bdev_retry_count,
            back.nvme_bdev_opts.bdev_retry_count
        );
        assert_eq!(cfg.bdev_opts.bdev_io_pool_size, back.bdev_opts.bdev_io_pool_size);
    }
}
