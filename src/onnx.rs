//! Just enough of the ONNX protobuf schema to load a model and describe it. The messages are
//! declared by hand with the prost derives rather than generated from `onnx.proto`, which saves
//! needing `protoc` around at build time. Field tags follow `onnx.proto`, anything not declared
//! here (initializer payloads, attributes, training info) is skipped by the decoder.
use crate::error::{ConvertError, LoadError};
use prost::Message;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(int64, tag = "1")]
    pub ir_version: i64,
    #[prost(string, tag = "2")]
    pub producer_name: String,
    #[prost(string, tag = "3")]
    pub producer_version: String,
    #[prost(string, tag = "4")]
    pub domain: String,
    #[prost(int64, tag = "5")]
    pub model_version: i64,
    #[prost(string, tag = "6")]
    pub doc_string: String,
    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,
    #[prost(message, repeated, tag = "8")]
    pub opset_import: Vec<OperatorSetIdProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OperatorSetIdProto {
    #[prost(string, tag = "1")]
    pub domain: String,
    #[prost(int64, tag = "2")]
    pub version: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeProto>,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "10")]
    pub doc_string: String,
    #[prost(message, repeated, tag = "11")]
    pub input: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "12")]
    pub output: Vec<ValueInfoProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    pub input: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub output: Vec<String>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub op_type: String,
    #[prost(string, tag = "7")]
    pub domain: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueInfoProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub r#type: Option<TypeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TypeProto {
    #[prost(oneof = "type_proto::Value", tags = "1")]
    pub value: Option<type_proto::Value>,
}

pub mod type_proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Tensor {
        #[prost(int32, tag = "1")]
        pub elem_type: i32,
        #[prost(message, optional, tag = "2")]
        pub shape: Option<super::TensorShapeProto>,
    }

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(message, tag = "1")]
        TensorType(Tensor),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "1")]
    pub dim: Vec<tensor_shape_proto::Dimension>,
}

pub mod tensor_shape_proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Dimension {
        #[prost(oneof = "dimension::Value", tags = "1, 2")]
        pub value: Option<dimension::Value>,
    }

    pub mod dimension {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Value {
            #[prost(int64, tag = "1")]
            DimValue(i64),
            #[prost(string, tag = "2")]
            DimParam(String),
        }
    }
}

/// Name of an ONNX `TensorProto.DataType` code
pub fn elem_type_name(code: i32) -> String {
    let name = match code {
        0 => "UNDEFINED",
        1 => "FLOAT",
        2 => "UINT8",
        3 => "INT8",
        4 => "UINT16",
        5 => "INT16",
        6 => "INT32",
        7 => "INT64",
        8 => "STRING",
        9 => "BOOL",
        10 => "FLOAT16",
        11 => "DOUBLE",
        12 => "UINT32",
        13 => "UINT64",
        14 => "COMPLEX64",
        15 => "COMPLEX128",
        16 => "BFLOAT16",
        n => return format!("UNKNOWN({})", n),
    };
    name.to_string()
}

/// A loaded model. We don't do anything with the graph other than describe it, the conversion
/// tools reload it themselves.
#[derive(Debug, Clone)]
pub struct OnnxModel {
    proto: ModelProto,
    size: u64,
}

/// Loads an ONNX model from disk. Anything prost can decode is accepted apart from an empty
/// message, which is what you get from decoding an empty (or truncated to nothing) file.
pub fn load(path: impl AsRef<Path>) -> Result<OnnxModel, ConvertError> {
    let path = path.as_ref();
    let load_err = |source: LoadError| ConvertError::Load {
        path: path.to_path_buf(),
        source,
    };

    let bytes = fs::read(path).map_err(|e| load_err(e.into()))?;
    let proto = ModelProto::decode(bytes.as_slice()).map_err(|e| load_err(e.into()))?;
    debug!("Decoded {} bytes from {}", bytes.len(), path.display());

    if proto.ir_version == 0 && proto.graph.is_none() {
        return Err(ConvertError::EmptyModel(path.to_path_buf()));
    }
    if proto.graph.is_none() {
        warn!("{} has no graph", path.display());
    }

    Ok(OnnxModel {
        proto,
        size: bytes.len() as u64,
    })
}

impl OnnxModel {
    pub fn from_proto(proto: ModelProto) -> Self {
        let size = proto.encoded_len() as u64;
        Self { proto, size }
    }

    /// Opset version for the default (`ai.onnx`) domain, if imported
    pub fn default_opset(&self) -> Option<i64> {
        self.proto
            .opset_import
            .iter()
            .find(|x| x.domain.is_empty() || x.domain == "ai.onnx")
            .map(|x| x.version)
    }

    pub fn summary(&self) -> ModelSummary {
        let mut operators = BTreeMap::new();
        let (graph_name, nodes, inputs, outputs) = match &self.proto.graph {
            Some(graph) => {
                for node in &graph.node {
                    *operators.entry(node.op_type.clone()).or_insert(0) += 1;
                }
                (
                    graph.name.clone(),
                    graph.node.len(),
                    graph.input.iter().map(TensorDesc::from).collect::<Vec<_>>(),
                    graph.output.iter().map(TensorDesc::from).collect::<Vec<_>>(),
                )
            }
            None => (String::new(), 0, vec![], vec![]),
        };

        ModelSummary {
            size_bytes: self.size,
            ir_version: self.proto.ir_version,
            producer: format!(
                "{} {}",
                self.proto.producer_name, self.proto.producer_version
            )
            .trim()
            .to_string(),
            opsets: self
                .proto
                .opset_import
                .iter()
                .map(|x| {
                    let domain = if x.domain.is_empty() {
                        "ai.onnx".to_string()
                    } else {
                        x.domain.clone()
                    };
                    (domain, x.version)
                })
                .collect(),
            graph_name,
            nodes,
            operators,
            inputs,
            outputs,
        }
    }
}

/// What the model looks like from the outside
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSummary {
    pub size_bytes: u64,
    pub ir_version: i64,
    pub producer: String,
    pub opsets: BTreeMap<String, i64>,
    pub graph_name: String,
    pub nodes: usize,
    /// Number of nodes for each operator type
    pub operators: BTreeMap<String, usize>,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorDesc {
    pub name: String,
    pub elem_type: String,
    /// Dimensions, symbolic ones use their parameter name and unknown ones are `?`
    pub shape: Vec<String>,
}

impl From<&ValueInfoProto> for TensorDesc {
    fn from(info: &ValueInfoProto) -> Self {
        use tensor_shape_proto::dimension::Value as Dim;
        use type_proto::Value;

        let (elem_type, shape) = match info.r#type.as_ref().and_then(|x| x.value.as_ref()) {
            Some(Value::TensorType(t)) => {
                let shape = t
                    .shape
                    .iter()
                    .flat_map(|s| s.dim.iter())
                    .map(|d| match &d.value {
                        Some(Dim::DimValue(v)) => v.to_string(),
                        Some(Dim::DimParam(p)) if !p.is_empty() => p.clone(),
                        _ => "?".to_string(),
                    })
                    .collect();
                (elem_type_name(t.elem_type), shape)
            }
            None => (elem_type_name(0), vec![]),
        };

        Self {
            name: info.name.clone(),
            elem_type,
            shape,
        }
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}[{}]", self.name, self.elem_type, self.shape.join(", "))
    }
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "IR version: {}", self.ir_version)?;
        writeln!(f, "Producer: {}", self.producer)?;
        for (domain, version) in &self.opsets {
            writeln!(f, "Opset {}: {}", domain, version)?;
        }
        writeln!(f, "Graph: '{}' ({} nodes)", self.graph_name, self.nodes)?;
        for input in &self.inputs {
            writeln!(f, "  input  {}", input)?;
        }
        for output in &self.outputs {
            writeln!(f, "  output {}", output)?;
        }
        for (op, count) in &self.operators {
            writeln!(f, "  {:>6} x {}", count, op)?;
        }
        Ok(())
    }
}
