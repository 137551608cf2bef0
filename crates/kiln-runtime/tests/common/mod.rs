//! Common test utilities for runtime tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kiln_core::{
    ActivationMode, ConvolutionParams, DataType, DeviceSliceMut, Error, FusedConvolutionParams,
    Graph, MemoryManager, NodeKind, Operation, OperationBase, OperationRegistry, Result, Stream,
    TensorId,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Deterministic values in roughly `[-scale, scale]`.
pub fn pattern(len: usize, scale: f32) -> Vec<f32> {
    (0..len)
        .map(|i| (((i * 37 + 11) % 23) as f32 - 11.0) / 11.0 * scale)
        .collect()
}

/// Handles of the residual block graph.
pub struct ResidualBlock {
    pub graph: Graph,
    pub weights: TensorId,
    pub hidden: TensorId,
}

/// `hidden = relu(conv3x3(input) + bias + skip)`, then
/// `features = concat(input, hidden)` and `grew = hidden > input`.
///
/// Inputs are `input` and `skip` (both `[1, 2, 4, 4]`); outputs are
/// `features` (`[1, 4, 4, 4]`) and `grew` (bool `[1, 2, 4, 4]`).
pub fn residual_block() -> ResidualBlock {
    let shape = [1, 2, 4, 4];
    let mut graph = Graph::new("residual_block");
    let input = graph.add_input("input", DataType::F32, &shape);
    let skip = graph.add_input("skip", DataType::F32, &shape);
    let weights = graph
        .add_constant_f32("weights", &[2, 2, 3, 3], &pattern(36, 0.2))
        .unwrap();
    let bias = graph.add_constant_f32("bias", &[2], &[0.1, -0.1]).unwrap();
    let hidden = graph.add_intermediate("hidden", DataType::F32, &shape);
    let features = graph.add_output("features", DataType::F32, &[1, 4, 4, 4]);
    let grew = graph.add_output("grew", DataType::Bool, &shape);

    let params = FusedConvolutionParams {
        conv: ConvolutionParams::default().with_padding(1),
        activation: ActivationMode::Relu,
    };
    graph
        .add_node(
            "conv",
            NodeKind::FusedConvolution(params),
            &[input, weights, bias, skip],
            &[hidden],
        )
        .unwrap();
    graph
        .add_node("concat", NodeKind::Concat { axis: 1 }, &[input, hidden], &[features])
        .unwrap();
    graph
        .add_node("grew", NodeKind::Greater, &[hidden, input], &[grew])
        .unwrap();

    ResidualBlock {
        graph,
        weights,
        hidden,
    }
}

/// Relu whose device command rejects NaN inputs, and whose enqueue can be
/// switched to fail.
pub struct CheckedRelu {
    base: OperationBase,
    reject_enqueue: Arc<AtomicBool>,
}

impl Operation for CheckedRelu {
    fn base(&self) -> &OperationBase {
        &self.base
    }

    fn execute(
        &self,
        stream: &Stream,
        memory: &MemoryManager,
        _scratch: Option<&DeviceSliceMut>,
    ) -> Result<()> {
        if self.reject_enqueue.load(Ordering::SeqCst) {
            return Err(Error::Device("command queue rejected work".to_string()));
        }
        let input = memory.input_tensor(self.base.input_ids()[0])?;
        let output = memory.output_tensor(self.base.output_ids()[0])?;
        stream.enqueue(self.base.label("relu"), move || {
            let values: Vec<f32> = input.read()?;
            if values.iter().any(|v| v.is_nan()) {
                return Err(Error::Device("NaN input".to_string()));
            }
            let out: Vec<f32> = values.iter().map(|v| v.max(0.0)).collect();
            output.write(&out)
        })
    }
}

/// Core registry with `CheckedRelu` preferred for Relu nodes.
pub fn checked_relu_registry(reject_enqueue: Arc<AtomicBool>) -> OperationRegistry {
    let mut registry = kiln_operators::core_operation_registry();
    registry.register("Relu", "CheckedRelu", 1000, move |_device, node, inputs, outputs| {
        Ok(Box::new(CheckedRelu {
            base: OperationBase::new(node, "CheckedRelu", inputs, outputs),
            reject_enqueue: Arc::clone(&reject_enqueue),
        }))
    });
    registry
}

/// `y = relu(x)` over four elements.
pub fn relu_graph() -> Graph {
    let mut graph = Graph::new("relu");
    let x = graph.add_input("x", DataType::F32, &[4]);
    let y = graph.add_output("y", DataType::F32, &[4]);
    graph.add_node("relu", NodeKind::Relu, &[x], &[y]).unwrap();
    graph
}
