use birdnest_convert::onnx;
use clap::Parser;
use std::path::PathBuf;

/// Prints what's inside an ONNX model: opsets, inputs, outputs and the operators used
#[derive(Parser, Debug)]
pub struct Args {
    /// Model to describe
    #[clap(default_value = "birdnest.onnx")]
    model: PathBuf,
    /// Output JSON instead of text
    #[clap(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    birdnest_convert::setup_logging()?;
    let args = Args::parse();

    let summary = onnx::load(&args.model)?.summary();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary);
    }
    Ok(())
}
