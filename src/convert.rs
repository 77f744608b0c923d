//! The conversion driver. This is a straight line through the stages in [`Stage`]: check the
//! tools are installed, load the model, export a SavedModel into a scratch directory, convert that
//! to a tfjs graph model and then clean up. The only early exit that isn't an error from one of
//! the steps is missing dependencies, and that's checked before anything touches the disk.
use crate::error::{ConvertError, Stage};
use crate::manifest::{self, ManifestSummary};
use crate::onnx::{self, ModelSummary};
use crate::scratch::ScratchDir;
use crate::toolchain::{TfjsOptions, Toolchain};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{self, Component, Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Where things are read from and written to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionPaths {
    /// The ONNX model to convert
    pub input: PathBuf,
    /// Scratch directory for the intermediate SavedModel, removed after the run
    pub saved_model_dir: PathBuf,
    /// Where the tfjs graph model ends up
    pub output_dir: PathBuf,
}

impl Default for ConversionPaths {
    fn default() -> Self {
        Self {
            input: PathBuf::from("birdnest.onnx"),
            saved_model_dir: PathBuf::from("temp_saved_model"),
            output_dir: PathBuf::from("public/models/birdnest"),
        }
    }
}

impl ConversionPaths {
    /// The scratch directory gets removed recursively, so it mustn't be, contain or sit inside
    /// the output directory, and it mustn't contain the input model.
    pub fn check_disjoint(&self) -> Result<(), ConvertError> {
        let resolve_err = |p: &Path| {
            ConvertError::io(
                Stage::CheckDeps,
                format!("failed to resolve {}", p.display()),
            )
        };
        let scratch = resolve(&self.saved_model_dir)
            .map_err(resolve_err(self.saved_model_dir.as_path()))?;
        let output = resolve(&self.output_dir).map_err(resolve_err(self.output_dir.as_path()))?;
        let input = resolve(&self.input).map_err(resolve_err(self.input.as_path()))?;

        let overlapping = |other: &PathBuf| ConvertError::OverlappingPaths {
            scratch: self.saved_model_dir.clone(),
            other: other.clone(),
        };
        if scratch.starts_with(&output) || output.starts_with(&scratch) {
            return Err(overlapping(&self.output_dir));
        }
        if input.starts_with(&scratch) {
            return Err(overlapping(&self.input));
        }
        Ok(())
    }
}

/// Absolute path with `.` and `..` folded away and symlinks resolved for whatever part of it
/// already exists. The rest may not have been created yet.
fn resolve(p: &Path) -> io::Result<PathBuf> {
    let mut normal = PathBuf::new();
    for component in path::absolute(p)?.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normal.pop();
            }
            c => normal.push(c),
        }
    }

    let mut existing = normal.as_path();
    let mut missing = vec![];
    loop {
        if let Ok(mut resolved) = fs::canonicalize(existing) {
            resolved.extend(missing.iter().rev());
            return Ok(resolved);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(normal),
        }
    }
}

/// Everything we know about a finished conversion
#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub paths: ConversionPaths,
    pub model: ModelSummary,
    pub tfjs: TfjsOptions,
    pub output: ManifestSummary,
    pub elapsed_secs: f64,
}

pub struct Converter<T> {
    toolchain: T,
    paths: ConversionPaths,
    options: TfjsOptions,
    keep_saved_model: bool,
}

fn enter(stage: Stage) {
    debug!("Entering {}", stage);
}

impl<T: Toolchain> Converter<T> {
    pub fn new(toolchain: T, paths: ConversionPaths) -> Self {
        Self {
            toolchain,
            paths,
            options: TfjsOptions::default(),
            keep_saved_model: false,
        }
    }

    pub fn with_options(mut self, options: TfjsOptions) -> Self {
        self.options = options;
        self
    }

    /// Leave the intermediate SavedModel on disk, handy when the tfjs conversion is the part
    /// going wrong
    pub fn keep_saved_model(mut self, keep: bool) -> Self {
        self.keep_saved_model = keep;
        self
    }

    pub fn run(&self) -> Result<ConversionReport, ConvertError> {
        let start = Instant::now();
        let paths = &self.paths;

        enter(Stage::CheckDeps);
        paths.check_disjoint()?;
        let missing = self.toolchain.probe();
        if !missing.is_empty() {
            return Err(ConvertError::MissingDependencies(missing));
        }

        enter(Stage::Load);
        info!("Loading ONNX model...");
        let model = onnx::load(&paths.input)?;
        let summary = model.summary();
        info!(
            "Loaded {} ({} nodes, opset {})",
            paths.input.display(),
            summary.nodes,
            model
                .default_opset()
                .map(|x| x.to_string())
                .unwrap_or_else(|| "?".to_string())
        );

        enter(Stage::Export);
        // From here on the scratch directory is removed however we leave this function
        let mut scratch = ScratchDir::create(&paths.saved_model_dir).map_err(ConvertError::io(
            Stage::Export,
            format!("failed to create {}", paths.saved_model_dir.display()),
        ))?;
        if self.keep_saved_model {
            scratch.keep();
        }
        self.toolchain
            .export_saved_model(&paths.input, scratch.path())?;

        enter(Stage::Convert);
        fs::create_dir_all(&paths.output_dir).map_err(ConvertError::io(
            Stage::Convert,
            format!("failed to create {}", paths.output_dir.display()),
        ))?;
        self.toolchain
            .convert_to_tfjs(scratch.path(), &paths.output_dir, &self.options)?;
        let output = manifest::verify(&paths.output_dir)?;
        info!(
            "Wrote {} weight shards ({} bytes)",
            output.shards, output.shard_bytes
        );

        enter(Stage::Cleanup);
        drop(scratch);

        enter(Stage::Done);
        info!(
            "Conversion complete! Files are in {}/",
            paths.output_dir.display()
        );

        Ok(ConversionReport {
            paths: paths.clone(),
            model: summary,
            tfjs: self.options.clone(),
            output,
            elapsed_secs: start.elapsed().as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::write_graph_model;
    use crate::onnx::tests::birdnest_proto;
    use crate::toolchain::Requirement;
    use prost::Message;
    use std::cell::RefCell;
    use std::path::Path;
    use std::process::ExitStatus;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn failed_status() -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(1 << 8)
    }

    #[cfg(windows)]
    fn failed_status() -> ExitStatus {
        use std::os::windows::process::ExitStatusExt;
        ExitStatus::from_raw(1)
    }

    /// Stands in for onnx-tf and the tfjs converter by writing files directly
    #[derive(Default)]
    struct FakeToolchain {
        missing: Vec<Requirement>,
        fail_export: bool,
        fail_convert: bool,
        /// Converter exits cleanly without writing anything
        empty_convert: bool,
        calls: RefCell<Vec<&'static str>>,
    }

    impl Toolchain for FakeToolchain {
        fn probe(&self) -> Vec<Requirement> {
            self.calls.borrow_mut().push("probe");
            self.missing.clone()
        }

        fn export_saved_model(
            &self,
            model: &Path,
            saved_model_dir: &Path,
        ) -> Result<(), ConvertError> {
            self.calls.borrow_mut().push("export");
            assert!(model.is_file());
            assert!(saved_model_dir.is_dir());
            fs::write(saved_model_dir.join("saved_model.pb"), b"graph").unwrap();
            if self.fail_export {
                return Err(ConvertError::ToolFailed {
                    tool: "onnx-tf export".to_string(),
                    stage: Stage::Export,
                    status: failed_status(),
                });
            }
            fs::create_dir_all(saved_model_dir.join("variables")).unwrap();
            Ok(())
        }

        fn convert_to_tfjs(
            &self,
            saved_model_dir: &Path,
            output_dir: &Path,
            options: &TfjsOptions,
        ) -> Result<(), ConvertError> {
            self.calls.borrow_mut().push("convert");
            assert!(saved_model_dir.join("saved_model.pb").is_file());
            assert!(output_dir.is_dir());
            assert_eq!(options.signature_name, "serving_default");
            if self.fail_convert {
                return Err(ConvertError::ToolFailed {
                    tool: "tensorflowjs_converter".to_string(),
                    stage: Stage::Convert,
                    status: failed_status(),
                });
            }
            if !self.empty_convert {
                write_graph_model(output_dir);
            }
            Ok(())
        }
    }

    fn setup() -> (TempDir, ConversionPaths) {
        let root = tempfile::tempdir().unwrap();
        let paths = ConversionPaths {
            input: root.path().join("birdnest.onnx"),
            saved_model_dir: root.path().join("temp_saved_model"),
            output_dir: root.path().join("public/models/birdnest"),
        };
        fs::write(&paths.input, birdnest_proto().encode_to_vec()).unwrap();
        (root, paths)
    }

    #[test]
    fn default_paths() {
        let paths = ConversionPaths::default();
        assert_eq!(paths.input, Path::new("birdnest.onnx"));
        assert_eq!(paths.saved_model_dir, Path::new("temp_saved_model"));
        assert_eq!(paths.output_dir, Path::new("public/models/birdnest"));
    }

    #[test]
    fn successful_conversion() {
        let (_root, paths) = setup();
        let converter = Converter::new(FakeToolchain::default(), paths.clone());

        let report = converter.run().unwrap();

        assert!(!paths.saved_model_dir.exists());
        assert!(fs::read_dir(&paths.output_dir).unwrap().count() > 0);
        assert!(paths.output_dir.join("model.json").is_file());
        assert_eq!(
            *converter.toolchain.calls.borrow(),
            vec!["probe", "export", "convert"]
        );
        assert_eq!(report.model.nodes, 4);
        assert_eq!(report.output.shards, 2);
        assert_eq!(report.paths, paths);
    }

    #[test]
    fn missing_dependencies_touch_nothing() {
        let (_root, paths) = setup();
        let toolchain = FakeToolchain {
            missing: vec![Requirement::module("onnx-tf", "onnx_tf")],
            ..Default::default()
        };
        let converter = Converter::new(toolchain, paths.clone());

        match converter.run() {
            Err(ConvertError::MissingDependencies(missing)) => assert_eq!(missing.len(), 1),
            e => panic!("Unexpected result: {:?}", e),
        }
        assert!(!paths.saved_model_dir.exists());
        assert!(!paths.output_dir.exists());
        assert_eq!(*converter.toolchain.calls.borrow(), vec!["probe"]);
    }

    #[test]
    fn runs_twice() {
        let (_root, paths) = setup();
        let converter = Converter::new(FakeToolchain::default(), paths.clone());

        converter.run().unwrap();
        converter.run().unwrap();
        assert!(!paths.saved_model_dir.exists());
        assert!(paths.output_dir.join("model.json").is_file());
    }

    #[test]
    fn stale_saved_model_removed() {
        let (_root, paths) = setup();
        fs::create_dir_all(paths.saved_model_dir.join("variables")).unwrap();
        fs::write(paths.saved_model_dir.join("old.pb"), b"stale").unwrap();

        Converter::new(FakeToolchain::default(), paths.clone())
            .run()
            .unwrap();
        assert!(!paths.saved_model_dir.exists());
    }

    #[test]
    fn converter_failure_is_an_error() {
        let (_root, paths) = setup();
        let toolchain = FakeToolchain {
            fail_convert: true,
            ..Default::default()
        };

        let err = Converter::new(toolchain, paths.clone()).run().unwrap_err();
        assert_eq!(err.stage(), Stage::Convert);
        assert!(matches!(err, ConvertError::ToolFailed { .. }));
        // Cleanup still happens
        assert!(!paths.saved_model_dir.exists());
    }

    #[test]
    fn export_failure_cleans_up() {
        let (_root, paths) = setup();
        let toolchain = FakeToolchain {
            fail_export: true,
            ..Default::default()
        };
        let converter = Converter::new(toolchain, paths.clone());

        let err = converter.run().unwrap_err();
        assert_eq!(err.stage(), Stage::Export);
        assert!(!paths.saved_model_dir.exists());
        assert!(!paths.output_dir.exists());
        assert_eq!(*converter.toolchain.calls.borrow(), vec!["probe", "export"]);
    }

    #[test]
    fn converter_output_checked() {
        let (_root, paths) = setup();
        let toolchain = FakeToolchain {
            empty_convert: true,
            ..Default::default()
        };

        let err = Converter::new(toolchain, paths.clone()).run().unwrap_err();
        assert!(matches!(err, ConvertError::InvalidOutput { .. }));
        assert!(!paths.saved_model_dir.exists());
    }

    #[test]
    fn load_failure_creates_nothing() {
        let (_root, paths) = setup();
        fs::remove_file(&paths.input).unwrap();
        let converter = Converter::new(FakeToolchain::default(), paths.clone());

        let err = converter.run().unwrap_err();
        assert_eq!(err.stage(), Stage::Load);
        assert!(!paths.saved_model_dir.exists());
        assert!(!paths.output_dir.exists());
        assert_eq!(*converter.toolchain.calls.borrow(), vec!["probe"]);
    }

    #[test]
    fn saved_model_can_be_kept() {
        let (_root, paths) = setup();
        Converter::new(FakeToolchain::default(), paths.clone())
            .keep_saved_model(true)
            .run()
            .unwrap();
        assert!(paths.saved_model_dir.join("saved_model.pb").is_file());
    }

    #[test]
    fn scratch_containing_output_rejected() {
        let (root, mut paths) = setup();
        let public = root.path().join("public");
        fs::create_dir_all(&public).unwrap();
        fs::write(public.join("index.html"), b"<html></html>").unwrap();
        paths.saved_model_dir = public.clone();
        let converter = Converter::new(FakeToolchain::default(), paths.clone());

        match converter.run() {
            Err(ConvertError::OverlappingPaths { scratch, other }) => {
                assert_eq!(scratch, public);
                assert_eq!(other, paths.output_dir);
            }
            e => panic!("Unexpected result: {:?}", e),
        }
        assert!(public.join("index.html").is_file());
        assert!(paths.input.is_file());
        assert!(converter.toolchain.calls.borrow().is_empty());
    }

    #[test]
    fn scratch_inside_output_rejected() {
        let (_root, mut paths) = setup();
        paths.saved_model_dir = paths.output_dir.join("tmp");
        assert!(matches!(
            paths.check_disjoint(),
            Err(ConvertError::OverlappingPaths { .. })
        ));

        // Same directory spelled differently
        paths.saved_model_dir = paths.output_dir.join("../birdnest/.");
        assert!(matches!(
            paths.check_disjoint(),
            Err(ConvertError::OverlappingPaths { .. })
        ));
    }

    #[test]
    fn scratch_containing_input_rejected() {
        let (root, mut paths) = setup();
        let models = root.path().join("models");
        fs::create_dir_all(&models).unwrap();
        let input = models.join("birdnest.onnx");
        fs::rename(&paths.input, &input).unwrap();
        paths.input = input.clone();
        paths.saved_model_dir = models;

        let err = Converter::new(FakeToolchain::default(), paths)
            .run()
            .unwrap_err();
        assert_eq!(err.stage(), Stage::CheckDeps);
        match err {
            ConvertError::OverlappingPaths { other, .. } => assert_eq!(other, input),
            e => panic!("Unexpected error: {:?}", e),
        }
        assert!(input.is_file());
    }

    #[test]
    fn similar_names_are_disjoint() {
        let (root, mut paths) = setup();
        paths.saved_model_dir = root.path().join("public/models/birdnest_tmp");
        assert!(paths.check_disjoint().is_ok());

        let paths = ConversionPaths::default();
        assert!(paths.check_disjoint().is_ok());
    }
}
