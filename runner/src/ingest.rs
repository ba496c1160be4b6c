use std::{
    fs,
    num::ParseFloatError,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

/// averaged total energy written by `process_mdout.perl`, relative to the job directory
pub const RESULT_FILE: &str = "Analysis/summary_avg.EPTOT";

#[derive(Debug, Error)]
pub enum IngestorError {
    #[error("Failed to read result file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Result file {0:?} holds no data")]
    Empty(PathBuf),
    #[error("Result line '{line}' in {path:?} has no value column")]
    MissingColumn { path: PathBuf, line: String },
    #[error("Result value in {path:?} is not a number")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseFloatError,
    },
}

/// Extract the result of a finished job from its working directory
pub fn read_result(job_dir: &Path) -> Result<f64, IngestorError> {
    let path = job_dir.join(RESULT_FILE);
    let content = fs::read_to_string(&path).map_err(|source| IngestorError::Read {
        path: path.clone(),
        source,
    })?;

    let value = parse_summary(&content, &path)?;
    debug!(path = ?path, value = value, "Read result");

    Ok(value)
}

/// the summary is `<time> <value>` per line, the last line carries the final average
fn parse_summary(content: &str, path: &Path) -> Result<f64, IngestorError> {
    let line = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .last()
        .ok_or_else(|| IngestorError::Empty(path.to_path_buf()))?;

    let column = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| IngestorError::MissingColumn {
            path: path.to_path_buf(),
            line: line.to_owned(),
        })?;

    column.parse().map_err(|source| IngestorError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
