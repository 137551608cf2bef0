//! Convolution family.
//!
//! Fused convolution nodes (`conv + bias [+ add] + activation`) have three
//! candidates, tried in this order:
//!
//! 1. `FusedConvolutionGraphApi`: one execution plan built through the device
//!    graph API. Only plain `FusedConvolution` nodes, only when the device
//!    exposes the API.
//! 2. `FusedConvolutionSingleCall`: one fused kernel call. The fused entry
//!    point misbehaves with an identity activation on any algorithm other
//!    than implicit precomputed GEMM, so that combination is rejected.
//! 3. `FusedConvolutionDecomposed`: convolution, bias, residual add and
//!    activation as separate stream commands.
//!
//! Plain `Convolution` nodes have a single candidate.

pub mod decomposed;
pub mod descriptors;
pub mod fused;
pub mod graph_api;
mod kernel;
pub mod plain;

pub use descriptors::{ConvolutionAlgorithm, ConvolutionGeometry};

use kiln_core::{
    ActivationMode, DeviceSlice, Error, GraphNode, MemoryManager, NodeKind, OperationBase,
    OperationRegistry, Result,
};

use crate::helpers::{inputs, require_f32};

pub const PLAIN: &str = "Convolution";
pub const GRAPH_API: &str = "FusedConvolutionGraphApi";
pub const SINGLE_CALL: &str = "FusedConvolutionSingleCall";
pub const DECOMPOSED: &str = "FusedConvolutionDecomposed";

/// Node types served by the fused candidates.
pub const FUSED_OP_TYPES: [&str; 2] = ["FusedConvolution", "FusedGroupConvolution"];

/// Parameters extracted from a convolution node, shared by every candidate.
#[derive(Debug, Clone)]
pub struct ConvolutionSpec {
    pub geometry: ConvolutionGeometry,
    pub activation: ActivationMode,
    /// Node carries a residual input added before the activation.
    pub has_add: bool,
}

impl ConvolutionSpec {
    pub fn from_node(node: &GraphNode) -> Result<Self> {
        let (conv, activation, groups, fused) = match &node.kind {
            NodeKind::Convolution(conv) => (conv, ActivationMode::None, 1, false),
            NodeKind::FusedConvolution(params) => (&params.conv, params.activation, 1, true),
            NodeKind::FusedGroupConvolution { params, groups } => {
                (&params.conv, params.activation, *groups, true)
            }
            other => {
                return Err(Error::Candidate(format!(
                    "{} is not a convolution",
                    other.op_type()
                )));
            }
        };
        require_f32(node)?;

        let output = node.output(0)?;
        let geometry = ConvolutionGeometry::new(node.input(0)?, node.input(1)?, output, conv, groups)?;

        let mut has_add = false;
        if fused {
            let bias = node.input(2)?;
            if bias.num_elements() != geometry.out_channels {
                return Err(Error::MalformedGraph(format!(
                    "bias of '{}' has {} elements, expected one per output channel ({})",
                    node.name,
                    bias.num_elements(),
                    geometry.out_channels
                )));
            }
            if node.input_count() == 4 {
                let add = node.input(3)?;
                if add.shape != output.shape {
                    return Err(Error::MalformedGraph(format!(
                        "residual input of '{}' has shape {:?}, expected {:?}",
                        node.name, add.shape, output.shape
                    )));
                }
                has_add = true;
            }
        }

        Ok(Self {
            geometry,
            activation,
            has_add,
        })
    }
}

/// Device tensors of a fused convolution.
struct FusedTensors {
    data: DeviceSlice,
    filter: DeviceSlice,
    bias: DeviceSlice,
    add: Option<DeviceSlice>,
}

impl FusedTensors {
    fn resolve(memory: &MemoryManager, base: &OperationBase, has_add: bool) -> Result<Self> {
        if has_add {
            let [data, filter, bias, add] = inputs(memory, base)?;
            Ok(Self {
                data,
                filter,
                bias,
                add: Some(add),
            })
        } else {
            let [data, filter, bias] = inputs(memory, base)?;
            Ok(Self {
                data,
                filter,
                bias,
                add: None,
            })
        }
    }
}

/// Register every convolution candidate.
pub fn register(registry: &mut OperationRegistry) {
    registry.register("Convolution", PLAIN, 100, plain::build);
    for op_type in FUSED_OP_TYPES {
        registry
            .register(op_type, GRAPH_API, 300, graph_api::build)
            .register(op_type, SINGLE_CALL, 200, fused::build)
            .register(op_type, DECOMPOSED, 100, decomposed::build);
    }
}
