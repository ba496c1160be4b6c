use crate::queue::DequeueOrder;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Config file is invalid")]
    Invalid(#[from] serde_yaml::Error),
    #[error("Amber installation root is not set, use amber.home or AMBERHOME")]
    MissingToolchain,
    #[error("Amber version is not set, use amber.version or AMBER_VERSION")]
    MissingVersion,
    #[error("Amber version '{0}' is not a number")]
    InvalidVersion(String),
    #[error("File {0:?} not found")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
    #[error("Preflight checks failed")]
    PreflightFailed,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // toolchain used to build and run each job
    #[serde(default)]
    pub amber: AmberConfig,
    // simulation parameters baked into the generated inputs
    #[serde(default)]
    pub md: MdConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    // wall clock limit for a single job in seconds, unbounded if missing
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct AmberConfig {
    /// installation root, falls back to `AMBERHOME`
    pub home: Option<PathBuf>,
    /// major version, falls back to `AMBER_VERSION`
    pub version: Option<u32>,
    #[serde(default)]
    pub engine: EngineSelector,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineSelector {
    #[default]
    Auto,
    Cuda,
    Cpu,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MdConfig {
    /// number of production steps
    #[serde(default = "default_nstlim")]
    pub nstlim: u64,
}

impl Default for MdConfig {
    fn default() -> Self {
        Self {
            nstlim: default_nstlim(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default)]
    pub order: DequeueOrder,
}

/// Simulation engine binary used by the driver script
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Engine {
    Cuda,
    Cpu,
}

impl Engine {
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Cuda => "pmemd.cuda",
            Self::Cpu => "sander",
        }
    }
}

/// Force field template flavour understood by the installed tleap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateVariant {
    /// Amber 14 and older ship `leaprc.ff14SB`
    Legacy,
    /// Amber 16 moved protein force fields to `leaprc.protein.*`
    Protein,
}

impl TemplateVariant {
    pub fn from_version(version: u32) -> Self {
        if version < 16 {
            Self::Legacy
        } else {
            Self::Protein
        }
    }

    pub fn leaprc(&self) -> &'static str {
        match self {
            Self::Legacy => "leaprc.ff14SB",
            Self::Protein => "leaprc.protein.ff14SB",
        }
    }
}

/// Fully resolved toolchain, only built through `RunnerConfig::toolchain`
#[derive(Clone, Debug)]
pub struct Toolchain {
    pub home: PathBuf,
    pub version: u32,
    pub engine: Engine,
    pub variant: TemplateVariant,
}

impl Toolchain {
    pub fn bin(&self, name: &str) -> PathBuf {
        self.home.join("bin").join(name)
    }

    /// make sure every binary a job needs is present, reporting all problems at once
    pub fn preflight_checks(&self) -> Result<(), ConfigErrors> {
        let mut contains_error = false;

        if !self.home.is_dir() {
            error!(
                "Amber installation root {} is not a directory",
                self.home.to_string_lossy()
            );
            contains_error = true;
        }

        for name in ["tleap", self.engine.binary(), "process_mdout.perl"] {
            let path = self.bin(name);

            match check_executable(&path) {
                Ok(true) => debug!(path = ?path, "Found {name}"),
                Ok(false) => {
                    error!("{} is not executable", path.to_string_lossy());
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if {} is an executable: {e}",
                        path.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        if contains_error {
            Err(ConfigErrors::PreflightFailed)
        } else {
            info!(
                home = ?self.home,
                version = self.version,
                engine = ?self.engine,
                "Toolchain ready"
            );

            Ok(())
        }
    }
}

impl RunnerConfig {
    /// read the config file if one is given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigErrors> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
                    path: path.to_path_buf(),
                    source,
                })?;

                Ok(serde_yaml::from_str(&content)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    /// Resolve the toolchain from the config file with the process environment as fallback
    pub fn toolchain(&self) -> Result<Toolchain, ConfigErrors> {
        self.toolchain_from(|key| std::env::var(key).ok())
    }

    fn toolchain_from(&self, env: impl Fn(&str) -> Option<String>) -> Result<Toolchain, ConfigErrors> {
        let home = self
            .amber
            .home
            .clone()
            .or_else(|| env("AMBERHOME").filter(|home| !home.is_empty()).map(PathBuf::from))
            .ok_or(ConfigErrors::MissingToolchain)?;

        let version = match self.amber.version {
            Some(version) => version,
            None => {
                let raw = env("AMBER_VERSION").ok_or(ConfigErrors::MissingVersion)?;
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigErrors::InvalidVersion(raw))?
            }
        };

        let engine = match self.amber.engine {
            EngineSelector::Cuda => Engine::Cuda,
            EngineSelector::Cpu => Engine::Cpu,
            EngineSelector::Auto => {
                if env("CUDA_HOME").is_some() || home.join("bin").join("pmemd.cuda").is_file() {
                    Engine::Cuda
                } else {
                    Engine::Cpu
                }
            }
        };

        Ok(Toolchain {
            variant: TemplateVariant::from_version(version),
            home,
            version,
            engine,
        })
    }
}

fn default_nstlim() -> u64 {
    5_000_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::BTreeMap, os::unix::fs::PermissionsExt};

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<BTreeMap<_, _>>();

        move |key| map.get(key).cloned()
    }

    #[test]
    fn parses_full_config() {
        let config: RunnerConfig = serde_yaml::from_str(
            "amber:\n  home: /opt/amber16\n  version: 16\n  engine: cpu\nmd:\n  nstlim: 50000\nqueue:\n  order: fifo\ntimeout: 3600\n",
        )
        .unwrap();

        assert_eq!(config.md.nstlim, 50_000);
        assert_eq!(config.queue.order, DequeueOrder::Fifo);
        assert_eq!(config.timeout(), Some(Duration::from_secs(3600)));

        let toolchain = config.toolchain_from(env_of(&[])).unwrap();
        assert_eq!(toolchain.home, PathBuf::from("/opt/amber16"));
        assert_eq!(toolchain.engine, Engine::Cpu);
        assert_eq!(toolchain.variant, TemplateVariant::Protein);
    }

    #[test]
    fn defaults_for_empty_config() {
        let config: RunnerConfig = serde_yaml::from_str("{}").unwrap();

        assert_eq!(config.md.nstlim, 5_000_000);
        assert_eq!(config.queue.order, DequeueOrder::Lifo);
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(serde_yaml::from_str::<RunnerConfig>("amber:\n  homedir: /opt\n").is_err());
    }

    #[test]
    fn missing_toolchain_is_fatal() {
        let config = RunnerConfig::default();

        assert!(matches!(
            config.toolchain_from(env_of(&[("AMBER_VERSION", "14")])),
            Err(ConfigErrors::MissingToolchain)
        ));
        assert!(matches!(
            config.toolchain_from(env_of(&[("AMBERHOME", "/opt/amber")])),
            Err(ConfigErrors::MissingVersion)
        ));
        assert!(matches!(
            config.toolchain_from(env_of(&[("AMBERHOME", "/opt/amber"), ("AMBER_VERSION", "x")])),
            Err(ConfigErrors::InvalidVersion(_))
        ));
    }

    #[test]
    fn environment_selects_engine_and_variant() {
        let config = RunnerConfig::default();

        let toolchain = config
            .toolchain_from(env_of(&[
                ("AMBERHOME", "/nonexistent/amber14"),
                ("AMBER_VERSION", "14"),
                ("CUDA_HOME", "/usr/local/cuda"),
            ]))
            .unwrap();
        assert_eq!(toolchain.engine, Engine::Cuda);
        assert_eq!(toolchain.variant, TemplateVariant::Legacy);
        assert_eq!(toolchain.variant.leaprc(), "leaprc.ff14SB");

        let toolchain = config
            .toolchain_from(env_of(&[
                ("AMBERHOME", "/nonexistent/amber18"),
                ("AMBER_VERSION", "18"),
            ]))
            .unwrap();
        assert_eq!(toolchain.engine, Engine::Cpu);
        assert_eq!(toolchain.bin("tleap"), PathBuf::from("/nonexistent/amber18/bin/tleap"));
    }

    #[test]
    fn preflight_requires_executables() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir(&bin).unwrap();

        let toolchain = Toolchain {
            home: dir.path().to_path_buf(),
            version: 18,
            engine: Engine::Cpu,
            variant: TemplateVariant::Protein,
        };
        assert!(matches!(
            toolchain.preflight_checks(),
            Err(ConfigErrors::PreflightFailed)
        ));

        for name in ["tleap", "sander", "process_mdout.perl"] {
            let path = bin.join(name);
            fs::write(&path, "#!/bin/sh\n").unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        toolchain.preflight_checks().unwrap();
    }
}
