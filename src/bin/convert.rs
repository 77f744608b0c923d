use anyhow::Context;
use birdnest_convert::toolchain::{
    PythonToolchain, Quantization, Requirement, TfjsOptions, INSTALL_HINT,
};
use birdnest_convert::*;
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// Converts the birdnest detector from ONNX to a TensorFlow.js graph model
#[derive(Parser, Debug)]
pub struct Args {
    /// ONNX model to convert
    #[clap(long, short, default_value = "birdnest.onnx")]
    input: PathBuf,
    /// Scratch directory for the intermediate SavedModel, removed when done
    #[clap(long, default_value = "temp_saved_model")]
    saved_model_dir: PathBuf,
    /// Directory to write the tfjs graph model to
    #[clap(long, short, default_value = "public/models/birdnest")]
    output: PathBuf,
    /// Python interpreter with onnx, onnx-tf and tensorflow installed
    #[clap(long, default_value = "python3")]
    python: PathBuf,
    /// The tensorflowjs converter executable
    #[clap(long, default_value = "tensorflowjs_converter")]
    converter: PathBuf,
    /// Serving signature to export
    #[clap(long, default_value = "serving_default")]
    signature_name: String,
    /// Tag set of the SavedModel metagraph
    #[clap(long, default_value = "serve")]
    saved_model_tags: String,
    /// Quantize the weights
    #[clap(long, value_enum)]
    quantize: Option<Quantization>,
    /// Maximum size of each weight shard
    #[clap(long)]
    weight_shard_size_bytes: Option<u64>,
    /// Don't delete the intermediate SavedModel
    #[clap(long)]
    keep_saved_model: bool,
    /// Write a JSON report of the conversion here
    #[clap(long)]
    report: Option<PathBuf>,
}

/// Exit status when the conversion tools aren't installed
const MISSING_DEPENDENCIES_EXIT: u8 = 1;

/// Lines telling the user what's missing and how to get it
fn dependency_diagnostics(missing: &[Requirement]) -> Vec<String> {
    let mut lines = missing
        .iter()
        .map(|x| format!("Missing required package: {}", x))
        .collect::<Vec<_>>();
    lines.push("Please install required packages:".to_string());
    lines.push(INSTALL_HINT.to_string());
    lines
}

/// Missing dependencies are reported here and turned into an exit status, any other failure is
/// passed back up with the stage it happened in.
fn handle_failure(e: ConvertError) -> anyhow::Result<u8> {
    match e {
        ConvertError::MissingDependencies(missing) => {
            for line in dependency_diagnostics(&missing) {
                error!("{}", line);
            }
            Ok(MISSING_DEPENDENCIES_EXIT)
        }
        e => {
            let stage = e.stage();
            Err(e).with_context(|| format!("conversion failed during {}", stage))
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    birdnest_convert::setup_logging()?;
    let args = Args::parse();

    let paths = ConversionPaths {
        input: args.input,
        saved_model_dir: args.saved_model_dir,
        output_dir: args.output,
    };
    let options = TfjsOptions {
        signature_name: args.signature_name,
        saved_model_tags: args.saved_model_tags,
        quantization: args.quantize,
        weight_shard_size_bytes: args.weight_shard_size_bytes,
    };

    let converter = Converter::new(PythonToolchain::new(args.python, args.converter), paths)
        .with_options(options)
        .keep_saved_model(args.keep_saved_model);

    let report = match converter.run() {
        Ok(report) => report,
        Err(e) => return handle_failure(e).map(ExitCode::from),
    };

    if let Some(path) = args.report {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(&path, json).with_context(|| format!("writing report to {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    Ok(ExitCode::SUCCESS)
}
