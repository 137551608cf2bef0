//! The optimized graph consumed by the backend.
//!
//! The graph arrives already fused. Every node carries a closed `NodeKind`
//! discriminant together with the parameters of that kind, so operation
//! builders pick their parameter extraction by matching on the variant
//! instead of probing node types at runtime.

use crate::types::{DataType, TensorDesc, TensorId};
use crate::{Error, Result};

/// Activation folded into a fused node.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ActivationMode {
    #[default]
    None,
    Relu,
    Sigmoid,
    Tanh,
}

impl ActivationMode {
    /// Apply the activation to one value.
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            ActivationMode::None => x,
            ActivationMode::Relu => x.max(0.0),
            ActivationMode::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActivationMode::Tanh => x.tanh(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ActivationMode::None => "none",
            ActivationMode::Relu => "relu",
            ActivationMode::Sigmoid => "sigmoid",
            ActivationMode::Tanh => "tanh",
        }
    }
}

/// Geometry of a 2D convolution over NCHW tensors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvolutionParams {
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    pub pads_begin: [usize; 2],
    pub pads_end: [usize; 2],
}

impl Default for ConvolutionParams {
    fn default() -> Self {
        Self {
            strides: [1, 1],
            dilations: [1, 1],
            pads_begin: [0, 0],
            pads_end: [0, 0],
        }
    }
}

impl ConvolutionParams {
    /// Symmetric padding on both spatial axes.
    pub fn with_padding(mut self, pad: usize) -> Self {
        self.pads_begin = [pad, pad];
        self.pads_end = [pad, pad];
        self
    }

    pub fn with_strides(mut self, strides: [usize; 2]) -> Self {
        self.strides = strides;
        self
    }

    pub fn with_dilations(mut self, dilations: [usize; 2]) -> Self {
        self.dilations = dilations;
        self
    }
}

/// Parameters shared by the fused convolution variants.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FusedConvolutionParams {
    pub conv: ConvolutionParams,
    pub activation: ActivationMode,
}

/// Node discriminant set when the graph is compiled.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Add,
    Subtract,
    Multiply,
    Less,
    Greater,
    Relu,
    Sigmoid,
    Tanh,
    /// Plain convolution: data, filter.
    Convolution(ConvolutionParams),
    /// Convolution + bias (+ optional residual add) + activation: data, filter, bias[, add].
    FusedConvolution(FusedConvolutionParams),
    /// Grouped variant of `FusedConvolution`.
    FusedGroupConvolution {
        params: FusedConvolutionParams,
        groups: usize,
    },
    /// Concatenation along `axis` (negative counts from the back).
    Concat { axis: i64 },
}

impl NodeKind {
    /// Registry key for this node kind.
    pub fn op_type(&self) -> &'static str {
        match self {
            NodeKind::Add => "Add",
            NodeKind::Subtract => "Subtract",
            NodeKind::Multiply => "Multiply",
            NodeKind::Less => "Less",
            NodeKind::Greater => "Greater",
            NodeKind::Relu => "Relu",
            NodeKind::Sigmoid => "Sigmoid",
            NodeKind::Tanh => "Tanh",
            NodeKind::Convolution(_) => "Convolution",
            NodeKind::FusedConvolution(_) => "FusedConvolution",
            NodeKind::FusedGroupConvolution { .. } => "FusedGroupConvolution",
            NodeKind::Concat { .. } => "Concat",
        }
    }
}

/// Metadata of one node as seen by operation builders.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub name: String,
    pub kind: NodeKind,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
}

impl GraphNode {
    pub fn new(
        name: impl Into<String>,
        kind: NodeKind,
        inputs: Vec<TensorDesc>,
        outputs: Vec<TensorDesc>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs,
            outputs,
        }
    }

    pub fn op_type(&self) -> &'static str {
        self.kind.op_type()
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Descriptor of input port `index`.
    pub fn input(&self, index: usize) -> Result<&TensorDesc> {
        self.inputs.get(index).ok_or_else(|| {
            Error::MalformedGraph(format!(
                "node '{}' has no input {index} (it has {})",
                self.name,
                self.inputs.len()
            ))
        })
    }

    /// Descriptor of output port `index`.
    pub fn output(&self, index: usize) -> Result<&TensorDesc> {
        self.outputs.get(index).ok_or_else(|| {
            Error::MalformedGraph(format!(
                "node '{}' has no output {index} (it has {})",
                self.name,
                self.outputs.len()
            ))
        })
    }
}

/// Role of a tensor in the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorKind {
    /// Provided by the caller before each execution.
    Input,
    /// Read back by the caller after each execution.
    Output,
    /// Produced and consumed inside the graph.
    Intermediate,
    /// Weight or constant, uploaded once at load time.
    Constant(Vec<u8>),
}

/// One entry of the graph's tensor table.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub desc: TensorDesc,
    pub kind: TensorKind,
}

impl TensorInfo {
    pub fn is_constant(&self) -> bool {
        matches!(self.kind, TensorKind::Constant(_))
    }
}

/// A node together with the identifiers bound to its ports.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub node: GraphNode,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

/// An optimized graph in execution (topological) order.
///
/// A tensor's position in the tensor table is its `TensorId`.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub name: String,
    tensors: Vec<TensorInfo>,
    nodes: Vec<NodeEntry>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tensors: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Add a tensor and return its identifier.
    pub fn add_tensor(
        &mut self,
        name: impl Into<String>,
        dtype: DataType,
        shape: &[usize],
        kind: TensorKind,
    ) -> TensorId {
        let id = TensorId::from(self.tensors.len());
        self.tensors.push(TensorInfo {
            name: name.into(),
            desc: TensorDesc::new(dtype, shape),
            kind,
        });
        id
    }

    pub fn add_input(&mut self, name: &str, dtype: DataType, shape: &[usize]) -> TensorId {
        self.add_tensor(name, dtype, shape, TensorKind::Input)
    }

    pub fn add_output(&mut self, name: &str, dtype: DataType, shape: &[usize]) -> TensorId {
        self.add_tensor(name, dtype, shape, TensorKind::Output)
    }

    pub fn add_intermediate(&mut self, name: &str, dtype: DataType, shape: &[usize]) -> TensorId {
        self.add_tensor(name, dtype, shape, TensorKind::Intermediate)
    }

    /// Add a constant tensor. The byte length must match the shape.
    pub fn add_constant(
        &mut self,
        name: &str,
        dtype: DataType,
        shape: &[usize],
        data: Vec<u8>,
    ) -> Result<TensorId> {
        let expected = TensorDesc::new(dtype, shape).size_bytes();
        if data.len() != expected {
            return Err(Error::MalformedGraph(format!(
                "constant '{name}' has {} bytes but {dtype}{shape:?} needs {expected}",
                data.len()
            )));
        }
        Ok(self.add_tensor(name, dtype, shape, TensorKind::Constant(data)))
    }

    /// Add an f32 constant.
    pub fn add_constant_f32(&mut self, name: &str, shape: &[usize], data: &[f32]) -> Result<TensorId> {
        self.add_constant(name, DataType::F32, shape, bytemuck::cast_slice(data).to_vec())
    }

    /// Append a node; its port descriptors are taken from the tensor table.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Result<()> {
        let name = name.into();
        let describe = |ids: &[TensorId]| -> Result<Vec<TensorDesc>> {
            ids.iter()
                .map(|&id| {
                    self.tensor(id).map(|t| t.desc.clone()).map_err(|_| {
                        Error::MalformedGraph(format!(
                            "node '{name}' references unknown tensor {id}"
                        ))
                    })
                })
                .collect()
        };
        let input_descs = describe(inputs)?;
        let output_descs = describe(outputs)?;

        self.nodes.push(NodeEntry {
            node: GraphNode::new(name, kind, input_descs, output_descs),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        });
        Ok(())
    }

    pub fn tensor(&self, id: TensorId) -> Result<&TensorInfo> {
        self.tensors
            .get(id.index())
            .ok_or_else(|| Error::MalformedGraph(format!("tensor {id} does not exist")))
    }

    /// Iterate over `(id, info)` pairs of the tensor table.
    pub fn tensors(&self) -> impl Iterator<Item = (TensorId, &TensorInfo)> {
        self.tensors
            .iter()
            .enumerate()
            .map(|(i, t)| (TensorId::from(i), t))
    }

    pub fn nodes(&self) -> &[NodeEntry] {
        &self.nodes
    }

    pub fn find_tensor(&self, name: &str) -> Option<TensorId> {
        self.tensors().find(|(_, t)| t.name == name).map(|(id, _)| id)
    }

    /// Identifiers of caller-provided inputs, in table order.
    pub fn inputs(&self) -> Vec<TensorId> {
        self.tensors()
            .filter(|(_, t)| t.kind == TensorKind::Input)
            .map(|(id, _)| id)
            .collect()
    }

    /// Identifiers of graph outputs, in table order.
    pub fn outputs(&self) -> Vec<TensorId> {
        self.tensors()
            .filter(|(_, t)| t.kind == TensorKind::Output)
            .map(|(id, _)| id)
            .collect()
    }
}
