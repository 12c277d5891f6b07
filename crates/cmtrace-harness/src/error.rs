use std::io;
use std::path::PathBuf;

use cmtrace_core::analysis::AnalysisError;
use cmtrace_core::{EncodeError, ReplayError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("{}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error("report: {0}")]
    Report(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl HarnessError {
    pub(crate) fn open(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Open { path, source }
    }
}
