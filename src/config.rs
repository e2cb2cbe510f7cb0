//! Settings for the installers, read from an optional JSON file. Every field has a default, so a
//! file only needs to name what it changes, e.g.
//!
//! ```json
//! { "pool": { "size": 8 }, "hadoop": { "replication": 3 } }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::InstallError;
use crate::plugins::{hadoop::HadoopSettings, skylark::SkylarkSettings, spark::SparkSettings};
use crate::pool::{Pool, DEFAULT_POOL_SIZE};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pool: PoolSettings,
    pub hadoop: HadoopSettings,
    pub spark: SparkSettings,
    pub skylark: SkylarkSettings,
}

impl Settings {
    /// Load settings from the JSON file at `path`, or the defaults if there is no file.
    pub fn load(path: Option<&str>) -> Result<Self, failure::Error> {
        let path = match path {
            Some(path) => path,
            None => return Ok(Settings::default()),
        };

        let bad = |cause: String| InstallError::BadSettings {
            path: path.into(),
            cause,
        };

        let contents = std::fs::read_to_string(path).map_err(|e| bad(e.to_string()))?;
        let settings: Settings = serde_json::from_str(&contents).map_err(|e| bad(e.to_string()))?;

        if settings.pool.size == 0 {
            return Err(bad("pool.size must be at least 1".into()).into());
        }

        Ok(settings)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of jobs that may run at once.
    pub size: usize,

    /// Fail a phase once any of its jobs has run this long. No limit if unset.
    pub job_timeout_secs: Option<u64>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            size: DEFAULT_POOL_SIZE,
            job_timeout_secs: None,
        }
    }
}

impl PoolSettings {
    pub fn build(&self) -> Pool {
        Pool::new(self.size, self.job_timeout_secs.map(Duration::from_secs))
    }
}
