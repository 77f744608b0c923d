//! Errors raised while converting a model. Each variant maps onto the stage of the pipeline it
//! came from so the CLI can say where things went wrong without parsing messages.
use crate::toolchain::Requirement;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

/// The steps the converter walks through, in order. There's no branching apart from the early
/// exit when dependencies are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize)]
pub enum Stage {
    CheckDeps,
    Load,
    Export,
    Convert,
    Cleanup,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::CheckDeps => "CHECK_DEPS",
            Self::Load => "LOAD",
            Self::Export => "EXPORT",
            Self::Convert => "CONVERT",
            Self::Cleanup => "CLEANUP",
            Self::Done => "DONE",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("missing required packages: {}", join(.0))]
    MissingDependencies(Vec<Requirement>),
    #[error("failed to load ONNX model {}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: LoadError,
    },
    #[error("{} does not contain an ONNX model", .0.display())]
    EmptyModel(PathBuf),
    #[error("{context}")]
    Io {
        stage: Stage,
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("unable to start {tool}")]
    ToolSpawn {
        tool: String,
        stage: Stage,
        #[source]
        source: io::Error,
    },
    #[error("{tool} failed ({status})")]
    ToolFailed {
        tool: String,
        stage: Stage,
        status: ExitStatus,
    },
    #[error("conversion produced no usable model in {}: {reason}", .path.display())]
    InvalidOutput { path: PathBuf, reason: String },
    #[error(
        "saved model directory {} overlaps {}, it would be deleted with the scratch directory",
        .scratch.display(),
        .other.display()
    )]
    OverlappingPaths { scratch: PathBuf, other: PathBuf },
}

/// Reading the file and decoding the protobuf fail in different ways, but callers only care
/// that the model couldn't be loaded.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
}

impl ConvertError {
    /// The stage of the pipeline this error was raised in
    pub fn stage(&self) -> Stage {
        match self {
            Self::MissingDependencies(_) | Self::OverlappingPaths { .. } => Stage::CheckDeps,
            Self::Load { .. } | Self::EmptyModel(_) => Stage::Load,
            Self::Io { stage, .. }
            | Self::ToolSpawn { stage, .. }
            | Self::ToolFailed { stage, .. } => *stage,
            Self::InvalidOutput { .. } => Stage::Convert,
        }
    }

    pub(crate) fn io(stage: Stage, context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io {
            stage,
            context,
            source,
        }
    }
}

fn join(reqs: &[Requirement]) -> String {
    reqs.iter()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
