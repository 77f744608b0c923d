use std::env;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod convert;
pub mod error;
pub mod manifest;
pub mod onnx;
pub mod scratch;
pub mod toolchain;

pub use convert::*;
pub use error::*;

pub fn setup_logging() -> anyhow::Result<()> {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("birdnest_convert=info,convert=info,inspect=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default().with_target(false);

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
