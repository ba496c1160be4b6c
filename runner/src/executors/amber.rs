use super::{
    residues,
    templates::{self, DRIVER, HEAT_INPUT, MINIMIZE_INPUT, PRODUCTION_INPUT, TLEAP_INPUT},
    Executor, ExecutorError,
};
use crate::{config::Toolchain, ingest::RESULT_FILE, queue::JobId, slots::SlotId};
use std::{
    env,
    ffi::OsString,
    fs::{self, File},
    io::ErrorKind,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

/// log of the tleap call inside the job directory
pub const TLEAP_LOG: &str = "tleap.log";
/// combined stdout/stderr of the driver inside the job directory
pub const DRIVER_LOG: &str = "ambsc.log";
/// environment variable the engine reads its device from
pub const DEVICE_VARIABLE: &str = "CUDA_VISIBLE_DEVICES";

/// Executor that builds a peptide with tleap and runs the MD stages through a driver script
#[derive(Debug, Clone)]
pub struct AmberExecutor {
    toolchain: Toolchain,
    nstlim: u64,
    timeout: Option<Duration>,
}

impl AmberExecutor {
    pub fn new(toolchain: Toolchain, nstlim: u64, timeout: Option<Duration>) -> Self {
        Self {
            toolchain,
            nstlim,
            timeout,
        }
    }

    /// `PATH` with the toolchain binaries in front, the driver calls them by name
    fn search_path(&self) -> Result<OsString, ExecutorError> {
        let bin = self.toolchain.home.join("bin");
        let current = env::var_os("PATH").unwrap_or_default();
        let paths = std::iter::once(bin.clone()).chain(env::split_paths(&current));

        env::join_paths(paths).map_err(|error| ExecutorError::Io {
            path: bin,
            source: std::io::Error::new(ErrorKind::InvalidInput, error),
        })
    }

    fn command(&self, program: &Path, job_dir: &Path, log: &Path) -> Result<Command, ExecutorError> {
        let log_file = File::create(log).map_err(|source| ExecutorError::Io {
            path: log.to_path_buf(),
            source,
        })?;
        let log_clone = log_file.try_clone().map_err(|source| ExecutorError::Io {
            path: log.to_path_buf(),
            source,
        })?;

        let mut command = Command::new(program);
        command
            .current_dir(job_dir)
            .env("AMBERHOME", &self.toolchain.home)
            .env("PATH", self.search_path()?)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_clone));

        Ok(command)
    }
}

fn write_file(path: PathBuf, content: &str) -> Result<PathBuf, ExecutorError> {
    fs::write(&path, content).map_err(|source| ExecutorError::Io {
        path: path.clone(),
        source,
    })?;

    Ok(path)
}

impl Executor for AmberExecutor {
    #[instrument(skip(self), level = "info")]
    fn prepare(&self, job_dir: &Path, job: &JobId) -> Result<(), ExecutorError> {
        let names = residues::long_names(job.as_str())?;

        match fs::create_dir(job_dir) {
            Ok(()) => debug!(path = ?job_dir, "Created job directory"),
            // a rerun of a requeued job reuses its directory
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                warn!(path = ?job_dir, "Job directory already exists: {error}")
            }
            Err(source) => {
                return Err(ExecutorError::Io {
                    path: job_dir.to_path_buf(),
                    source,
                })
            }
        }

        let stale_result = job_dir.join(RESULT_FILE);
        match fs::remove_file(&stale_result) {
            Ok(()) => warn!(path = ?stale_result, "Removed result of an earlier attempt"),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ExecutorError::Io {
                    path: stale_result,
                    source,
                })
            }
        }

        write_file(
            job_dir.join(TLEAP_INPUT),
            &templates::tleap_input(self.toolchain.variant, &names),
        )?;
        write_file(job_dir.join(MINIMIZE_INPUT), templates::minimize_input())?;
        write_file(job_dir.join(HEAT_INPUT), templates::heat_input())?;
        write_file(
            job_dir.join(PRODUCTION_INPUT),
            &templates::production_input(self.nstlim),
        )?;

        let driver = write_file(
            job_dir.join(DRIVER),
            &templates::driver_script(self.toolchain.engine),
        )?;
        fs::set_permissions(&driver, fs::Permissions::from_mode(0o755)).map_err(|source| {
            ExecutorError::Io {
                path: driver.clone(),
                source,
            }
        })?;

        let tleap = self.toolchain.bin("tleap");
        let status = self
            .command(&tleap, job_dir, &job_dir.join(TLEAP_LOG))?
            .args(["-s", "-f", TLEAP_INPUT])
            .status()
            .map_err(|source| ExecutorError::Spawn {
                program: tleap.clone(),
                source,
            })?;

        if status.success() {
            debug!(job = %job, "Built topology");

            Ok(())
        } else {
            Err(ExecutorError::Failed {
                program: "tleap".to_owned(),
                status,
            })
        }
    }

    #[instrument(skip(self), level = "info")]
    fn run(&self, job_dir: &Path, slot: &SlotId) -> Result<ExitStatus, ExecutorError> {
        let driver = job_dir.join(DRIVER);
        let start = Instant::now();

        let mut child = self
            .command(&driver, job_dir, &job_dir.join(DRIVER_LOG))?
            .env(DEVICE_VARIABLE, slot.as_str())
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: driver.clone(),
                source,
            })?;

        debug!(pid = child.id(), "Driver started");

        let waited = match self.timeout {
            Some(timeout) => child.wait_timeout(timeout),
            None => child.wait().map(Some),
        };

        match waited {
            Ok(Some(status)) => {
                info!(
                    "Driver finished in {} s | status: {}",
                    start.elapsed().as_secs(),
                    status
                );

                Ok(status)
            }
            Ok(None) => {
                // child hasn't exited yet
                warn!(pid = child.id(), "Driver ran into timeout, killing it");

                if let Err(error) = child.kill().and_then(|_| child.wait()) {
                    warn!(error = ?error, "Failed to reap driver: {error}");
                }

                Err(ExecutorError::Timeout(self.timeout.unwrap_or_default()))
            }
            Err(source) => Err(ExecutorError::Spawn {
                program: driver,
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AmberExecutor, DRIVER_LOG};
    use crate::{
        config::{Engine, TemplateVariant, Toolchain},
        executors::{templates::DRIVER, Executor, ExecutorError},
        ingest::RESULT_FILE,
        queue::JobId,
        slots::SlotId,
    };
    use std::{fs, os::unix::fs::PermissionsExt, path::Path, time::Duration};

    fn script(path: &Path, body: &str) {
        fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// fake installation whose tleap just produces the topology files
    fn toolchain(root: &Path) -> Toolchain {
        let bin = root.join("bin");
        fs::create_dir_all(&bin).unwrap();
        script(&bin.join("tleap"), "touch prmtop inpcrd");

        Toolchain {
            home: root.to_path_buf(),
            version: 18,
            engine: Engine::Cpu,
            variant: TemplateVariant::Protein,
        }
    }

    #[test]
    fn prepare_writes_inputs_and_runs_tleap() {
        let amber = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let executor = AmberExecutor::new(toolchain(amber.path()), 50_000, None);
        let job_dir = base.path().join("GGG");

        executor
            .prepare(&job_dir, &JobId::new("GGG").unwrap())
            .unwrap();

        for file in ["tlsc", "1in", "2in", "3in", "ambsc", "prmtop", "inpcrd"] {
            assert!(job_dir.join(file).is_file(), "{file} is missing");
        }
        let mode = fs::metadata(job_dir.join(DRIVER)).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
        assert!(fs::read_to_string(job_dir.join("3in"))
            .unwrap()
            .contains("nstlim=50000,"));

        // an existing directory is reused
        executor
            .prepare(&job_dir, &JobId::new("GGG").unwrap())
            .unwrap();
    }

    #[test]
    fn prepare_clears_result_of_earlier_attempt() {
        let amber = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let executor = AmberExecutor::new(toolchain(amber.path()), 50_000, None);
        let job_dir = base.path().join("AGG");
        let summary = job_dir.join(RESULT_FILE);
        fs::create_dir_all(summary.parent().unwrap()).unwrap();
        fs::write(&summary, "5020.000  9.99").unwrap();

        executor
            .prepare(&job_dir, &JobId::new("AGG").unwrap())
            .unwrap();

        assert!(!summary.exists());
        assert!(executor.read_result(&job_dir).is_err());
    }

    #[test]
    fn prepare_rejects_unknown_residues() {
        let amber = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let executor = AmberExecutor::new(toolchain(amber.path()), 50_000, None);

        assert!(matches!(
            executor.prepare(&base.path().join("GXG"), &JobId::new("GXG").unwrap()),
            Err(ExecutorError::UnknownResidue('X'))
        ));
    }

    #[test]
    fn run_passes_slot_to_driver() {
        let amber = tempfile::tempdir().unwrap();
        let job_dir = tempfile::tempdir().unwrap();
        let executor = AmberExecutor::new(toolchain(amber.path()), 50_000, None);
        script(
            &job_dir.path().join(DRIVER),
            "echo \"device=$CUDA_VISIBLE_DEVICES home=$AMBERHOME\"",
        );

        let status = executor
            .run(job_dir.path(), &SlotId::new("3").unwrap())
            .unwrap();

        assert!(status.success());
        let log = fs::read_to_string(job_dir.path().join(DRIVER_LOG)).unwrap();
        assert!(log.contains("device=3"));
        assert!(log.contains(&format!("home={}", amber.path().display())));
    }

    #[test]
    fn run_kills_driver_after_timeout() {
        let amber = tempfile::tempdir().unwrap();
        let job_dir = tempfile::tempdir().unwrap();
        let executor = AmberExecutor::new(
            toolchain(amber.path()),
            50_000,
            Some(Duration::from_millis(200)),
        );
        script(&job_dir.path().join(DRIVER), "sleep 30");

        assert!(matches!(
            executor.run(job_dir.path(), &SlotId::new("0").unwrap()),
            Err(ExecutorError::Timeout(_))
        ));
    }
}
