//! The actual conversion work is done by tools we don't own: onnx-tf to get a SavedModel out of
//! the ONNX graph and the tensorflowjs converter to get from there to something a browser can
//! load. This module describes what we need from them and how we check they're there.
use crate::error::{ConvertError, Stage};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

pub mod python;

pub use python::*;

/// What to tell the user to run when something is missing
pub const INSTALL_HINT: &str = "pip install onnx onnx-tf tensorflow tensorflowjs";

/// Something that needs to be installed for the conversion to work
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Requirement {
    /// Name of the package providing it, as you'd pass it to pip
    pub package: String,
    pub kind: RequirementKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RequirementKind {
    /// A python module that has to be importable
    Module(String),
    /// An executable that has to be spawnable
    Program(PathBuf),
}

impl Requirement {
    pub fn module(package: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            kind: RequirementKind::Module(module.into()),
        }
    }

    pub fn program(package: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            package: package.into(),
            kind: RequirementKind::Program(program.into()),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            RequirementKind::Module(m) => write!(f, "{} ({})", self.package, m),
            RequirementKind::Program(p) => write!(f, "{} ({})", self.package, p.display()),
        }
    }
}

/// Weight quantization supported by the tensorflowjs converter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    Float16,
    Uint8,
    Uint16,
}

impl Quantization {
    fn flag(&self) -> &'static str {
        // The quantize flags take an optional list of weight names. Given bare they'd swallow the
        // positional directory after them, so pass a wildcard explicitly.
        match self {
            Self::Float16 => "--quantize_float16=*",
            Self::Uint8 => "--quantize_uint8=*",
            Self::Uint16 => "--quantize_uint16=*",
        }
    }
}

/// Options passed through to the tensorflowjs converter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TfjsOptions {
    /// Name of the serving signature to export
    pub signature_name: String,
    /// Tag set identifying the metagraph in the SavedModel
    pub saved_model_tags: String,
    pub quantization: Option<Quantization>,
    pub weight_shard_size_bytes: Option<u64>,
}

impl Default for TfjsOptions {
    fn default() -> Self {
        Self {
            signature_name: "serving_default".to_string(),
            saved_model_tags: "serve".to_string(),
            quantization: None,
            weight_shard_size_bytes: None,
        }
    }
}

impl TfjsOptions {
    /// Converter flags, without the input and output directories
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--input_format=tf_saved_model".to_string(),
            "--output_format=tfjs_graph_model".to_string(),
            format!("--signature_name={}", self.signature_name),
            format!("--saved_model_tags={}", self.saved_model_tags),
        ];
        if let Some(q) = self.quantization {
            args.push(q.flag().to_string());
        }
        if let Some(size) = self.weight_shard_size_bytes {
            args.push(format!("--weight_shard_size_bytes={}", size));
        }
        args
    }
}

/// The external tools the converter drives. The real implementation shells out, tests swap in
/// something that writes files directly.
pub trait Toolchain {
    /// Returns every requirement that isn't available. Must not touch the filesystem.
    fn probe(&self) -> Vec<Requirement>;

    /// Translate the ONNX model at `model` into a SavedModel written to `saved_model_dir`
    fn export_saved_model(&self, model: &Path, saved_model_dir: &Path)
        -> Result<(), ConvertError>;

    /// Convert the SavedModel in `saved_model_dir` to a tfjs graph model in `output_dir`
    fn convert_to_tfjs(
        &self,
        saved_model_dir: &Path,
        output_dir: &Path,
        options: &TfjsOptions,
    ) -> Result<(), ConvertError>;
}

/// Runs a command to completion with inherited stdio and turns a non-zero exit into an error.
/// There's no timeout, a hung tool hangs us too.
pub(crate) fn run_tool(mut cmd: Command, tool: &str, stage: Stage) -> Result<(), ConvertError> {
    debug!("Running {:?}", cmd);
    let status = cmd.status().map_err(|source| ConvertError::ToolSpawn {
        tool: tool.to_string(),
        stage,
        source,
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(ConvertError::ToolFailed {
            tool: tool.to_string(),
            stage,
            status,
        })
    }
}
