//! Daemon configuration.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use warden_store::{Backend, FileBackend, MemoryBackend};

use crate::datetime::TimeSpan;
use crate::error::Error;
use crate::hsm::{Hsm, soft::SoftHsm};
use crate::scheduler::SchedulerOptions;

/// The configuration file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/warden/config.toml";

//----------- Config -----------------------------------------------------------

/// The daemon configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Where rows live.
    pub store: StoreConfig,

    /// The directory holding `<name>.toml` policy files.
    pub policy_dir: Utf8PathBuf,

    /// The directory signer configurations are written into.
    pub signconf_dir: Utf8PathBuf,

    /// The HSM serving key material.
    #[serde(default)]
    pub hsm: HsmConfig,

    /// Scheduler tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load the configuration from a TOML file.
    pub fn load(path: &Utf8Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::Configuration(format!("cannot read configuration '{path}': {err}"))
        })?;
        toml::from_str(&text).map_err(|err| {
            Error::Configuration(format!("cannot parse configuration '{path}': {err}"))
        })
    }

    /// Open the configured store engine.
    pub fn open_store(&self) -> Result<Arc<dyn Backend>, Error> {
        Ok(match &self.store.engine {
            StoreEngine::Memory => Arc::new(MemoryBackend::new()),
            StoreEngine::File => {
                let path = self.store.path.as_ref().ok_or_else(|| {
                    Error::Configuration(
                        "the file store engine requires 'store.path'".into(),
                    )
                })?;
                Arc::new(FileBackend::open(path)?)
            }
        })
    }

    /// Build the configured HSM binding.
    pub fn build_hsm(&self) -> Arc<dyn Hsm> {
        Arc::new(SoftHsm::new(self.hsm.repositories.clone()))
    }

    /// The scheduler options this configuration describes.
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            workers: self.scheduler.workers,
            backoff_base: self.scheduler.backoff_base.duration(),
            backoff_ceiling: self.scheduler.backoff_ceiling.duration(),
            tick_deadline: self.scheduler.tick_deadline.duration(),
        }
    }

    /// The signer configuration path for a zone name.
    pub fn signconf_path(&self, zone: &str) -> Utf8PathBuf {
        self.signconf_dir.join(format!("{zone}.json"))
    }
}

//----------- StoreConfig ------------------------------------------------------

/// Where rows live.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StoreConfig {
    /// The storage engine.
    pub engine: StoreEngine,

    /// The snapshot path; required by the file engine.
    #[serde(default)]
    pub path: Option<Utf8PathBuf>,
}

/// A storage engine choice.
#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreEngine {
    /// Rows live in process memory only.
    Memory,

    /// Rows are snapshotted to disk on every commit.
    File,
}

//----------- HsmConfig --------------------------------------------------------

/// The HSM serving key material.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct HsmConfig {
    /// The repositories policies may refer to.
    pub repositories: Vec<String>,
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            repositories: vec!["default".into()],
        }
    }
}

//----------- SchedulerConfig --------------------------------------------------

/// Scheduler tuning.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SchedulerConfig {
    /// How many zones may tick concurrently.
    pub workers: usize,

    /// The first back-off applied to a failing zone.
    pub backoff_base: TimeSpan,

    /// The largest back-off ever applied.
    pub backoff_ceiling: TimeSpan,

    /// The soft deadline for one zone tick.
    pub tick_deadline: TimeSpan,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff_base: TimeSpan::from_secs(60),
            backoff_ceiling: TimeSpan::from_secs(3600),
            tick_deadline: TimeSpan::from_secs(30),
        }
    }
}

//----------- LoggingConfig ----------------------------------------------------

/// Logging.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LoggingConfig {
    /// The filter directive (e.g. "info", "wardend=debug").
    pub level: String,

    /// Where log output goes.
    pub target: LogTarget,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            target: LogTarget::Stdout,
        }
    }
}

/// A log output target.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogTarget {
    /// Standard output, with colors when the terminal supports them.
    Stdout,

    /// Standard error.
    Stderr,

    /// Append to a file.
    File(Utf8PathBuf),
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_configuration() {
        let config: Config = toml::from_str(
            r#"
            policy-dir = "/etc/warden/policies"
            signconf-dir = "/var/lib/warden/signconf"

            [store]
            engine = "file"
            path = "/var/lib/warden/store.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.workers, 4);
        assert_eq!(config.hsm.repositories, vec!["default".to_string()]);
        assert_eq!(config.signconf_path("example.com").as_str(),
            "/var/lib/warden/signconf/example.com.json");
    }
}
