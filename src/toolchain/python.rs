use super::*;
use std::ffi::OsStr;
use std::process::Stdio;
use tracing::{debug, info};

/// Snippet that loads the ONNX model and exports it with the onnx-tf backend. Arguments are the
/// model path then the SavedModel directory.
const EXPORT_SCRIPT: &str = include_str!("../../scripts/export_saved_model.py");

/// Checks a module can be found without importing it, importing tensorflow takes ages.
const FIND_MODULE: &str =
    "import importlib.util, sys; sys.exit(0 if importlib.util.find_spec(sys.argv[1]) else 1)";

/// Python modules needed by the export step paired with the pip package that provides them
const PYTHON_MODULES: [(&str, &str); 3] = [
    ("onnx", "onnx"),
    ("onnx-tf", "onnx_tf"),
    ("tensorflow", "tensorflow"),
];

/// The python ecosystem toolchain, onnx-tf for the export and `tensorflowjs_converter` for the
/// final step.
#[derive(Debug, Clone)]
pub struct PythonToolchain {
    /// Interpreter with onnx, onnx-tf and tensorflow installed
    pub python: PathBuf,
    /// The tensorflowjs converter executable
    pub converter: PathBuf,
}

impl Default for PythonToolchain {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python3"),
            converter: PathBuf::from("tensorflowjs_converter"),
        }
    }
}

impl PythonToolchain {
    pub fn new(python: impl Into<PathBuf>, converter: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            converter: converter.into(),
        }
    }

    fn has_module(&self, module: &str) -> bool {
        let status = Command::new(&self.python)
            .args(["-c", FIND_MODULE, module])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) => s.success(),
            Err(e) => {
                debug!("Couldn't run {}: {}", self.python.display(), e);
                false
            }
        }
    }

    fn has_converter(&self) -> bool {
        // Only failing to spawn counts as missing, older converters don't all exit cleanly on
        // `--version`
        let status = Command::new(&self.converter)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = &status {
            debug!("Couldn't run {}: {}", self.converter.display(), e);
        }
        status.is_ok()
    }
}

fn tool_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or_else(|| OsStr::new("?"))
        .to_string_lossy()
        .into_owned()
}

impl Toolchain for PythonToolchain {
    fn probe(&self) -> Vec<Requirement> {
        let mut missing = PYTHON_MODULES
            .iter()
            .filter(|(_, module)| !self.has_module(module))
            .map(|(package, module)| Requirement::module(*package, *module))
            .collect::<Vec<_>>();

        if !self.has_converter() {
            missing.push(Requirement::program("tensorflowjs", &self.converter));
        }
        missing
    }

    fn export_saved_model(
        &self,
        model: &Path,
        saved_model_dir: &Path,
    ) -> Result<(), ConvertError> {
        let mut cmd = Command::new(&self.python);
        cmd.arg("-c")
            .arg(EXPORT_SCRIPT)
            .arg(model)
            .arg(saved_model_dir);

        info!("Converting ONNX to TensorFlow SavedModel...");
        run_tool(cmd, "onnx-tf export", Stage::Export)
    }

    fn convert_to_tfjs(
        &self,
        saved_model_dir: &Path,
        output_dir: &Path,
        options: &TfjsOptions,
    ) -> Result<(), ConvertError> {
        let mut cmd = Command::new(&self.converter);
        cmd.args(options.to_args())
            .arg(saved_model_dir)
            .arg(output_dir);

        info!("Converting to TensorFlow.js format...");
        run_tool(cmd, &tool_name(&self.converter), Stage::Convert)
    }
}
