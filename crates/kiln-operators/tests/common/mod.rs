//! Common test utilities for operation tests.
//!
//! Builds every node of a small graph through the registry and runs the
//! resulting operations on the reference device, without the runtime crate.

#![allow(dead_code)]

use kiln_core::{
    ActivationMode, ConvolutionParams, DataType, Device, DeviceSliceMut, FusedConvolutionParams,
    Graph, ImmutableBlockBuilder, MemoryManager, MemoryModelBuilder, NodeKind, Operation,
    OperationRegistry, Result, Stream, TensorId, TensorKind, memory::align_up,
};

pub use kiln_operators::core_operation_registry;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Operations of a graph bound to device memory, ready to execute.
pub struct Prepared {
    pub ops: Vec<Box<dyn Operation>>,
    pub memory: MemoryManager,
    pub stream: Stream,
    scratch: Option<DeviceSliceMut>,
}

/// Build, place and initialize every node of `graph`.
pub fn prepare(device: &Device, graph: &Graph, registry: &OperationRegistry) -> Result<Prepared> {
    let mut constants = ImmutableBlockBuilder::with_alignment(16);
    let mut layout = MemoryModelBuilder::with_alignment(16);
    for (id, info) in graph.tensors() {
        match &info.kind {
            TensorKind::Constant(data) => {
                constants.add(id, data.clone())?;
            }
            _ => {
                layout.add(id, info.desc.size_bytes())?;
            }
        }
    }
    let memory = MemoryManager::new(device, constants.build(device)?, layout.build())?;

    let mut ops = Vec::new();
    for entry in graph.nodes() {
        let op = registry.build(device, &entry.node, &entry.inputs, &entry.outputs)?;
        memory.validate(op.base())?;
        ops.push(op);
    }

    let stream = device.create_stream();
    let total: usize = ops
        .iter()
        .map(|op| align_up(op.immutable_workspace_size(), 16))
        .sum();
    if total > 0 {
        let workspace = device.allocate(total, "workspaces")?;
        let mut offset = 0;
        for op in ops.iter_mut() {
            let size = op.immutable_workspace_size();
            if size > 0 {
                op.set_immutable_workspace(workspace.slice_mut(offset, size)?, &stream)?;
                offset += align_up(size, 16);
            }
        }
        stream.synchronize()?;
        workspace.freeze();
    }

    let scratch_size = ops.iter().map(|op| op.mutable_workspace_size()).max().unwrap_or(0);
    let scratch = if scratch_size > 0 {
        let alloc = device.allocate(scratch_size, "scratch")?;
        Some(alloc.slice_mut(0, scratch_size)?)
    } else {
        None
    };

    Ok(Prepared {
        ops,
        memory,
        stream,
        scratch,
    })
}

impl Prepared {
    /// Write graph inputs, run every operation and wait for the stream.
    pub fn run(&self, inputs: &[(TensorId, &[f32])]) -> Result<()> {
        for (id, values) in inputs {
            self.memory
                .write_tensor(*id, bytemuck::cast_slice(values))?;
        }
        for op in &self.ops {
            op.execute(&self.stream, &self.memory, self.scratch.as_ref())?;
        }
        self.stream.synchronize()
    }

    pub fn read_f32(&self, id: TensorId) -> Vec<f32> {
        bytemuck::pod_collect_to_vec(&self.memory.read_tensor(id).unwrap())
    }

    pub fn implementations(&self) -> Vec<&'static str> {
        self.ops.iter().map(|op| op.base().implementation()).collect()
    }
}

/// Handles of a single fused-convolution graph.
pub struct ConvGraph {
    pub graph: Graph,
    pub data: TensorId,
    pub add: Option<TensorId>,
    pub output: TensorId,
}

/// `y = act(conv(x, w) + bias [+ add])` with NCHW input `[n, c, h, w]` and a
/// `[k, c / groups, r, r]` filter. Filter and bias are constants.
pub fn fused_conv_graph(
    input: [usize; 4],
    filters: usize,
    kernel: usize,
    groups: usize,
    conv: ConvolutionParams,
    activation: ActivationMode,
    with_add: bool,
) -> ConvGraph {
    let [n, c, h, w] = input;
    let out_h = (h + conv.pads_begin[0] + conv.pads_end[0] - conv.dilations[0] * (kernel - 1) - 1)
        / conv.strides[0]
        + 1;
    let out_w = (w + conv.pads_begin[1] + conv.pads_end[1] - conv.dilations[1] * (kernel - 1) - 1)
        / conv.strides[1]
        + 1;
    let filter_len = filters * (c / groups) * kernel * kernel;

    let mut graph = Graph::new("fused_conv");
    let data = graph.add_input("x", DataType::F32, &input);
    let filter = graph
        .add_constant_f32("w", &[filters, c / groups, kernel, kernel], &pattern(filter_len, 0.1))
        .unwrap();
    let bias = graph
        .add_constant_f32("b", &[filters], &pattern(filters, 0.5))
        .unwrap();
    let add = with_add.then(|| graph.add_input("residual", DataType::F32, &[n, filters, out_h, out_w]));
    let output = graph.add_output("y", DataType::F32, &[n, filters, out_h, out_w]);

    let params = FusedConvolutionParams { conv, activation };
    let kind = if groups == 1 {
        NodeKind::FusedConvolution(params)
    } else {
        NodeKind::FusedGroupConvolution { params, groups }
    };
    let mut inputs = vec![data, filter, bias];
    inputs.extend(add);
    graph.add_node("conv", kind, &inputs, &[output]).unwrap();

    ConvGraph {
        graph,
        data,
        add,
        output,
    }
}

/// Deterministic values in roughly `[-scale, scale]`.
pub fn pattern(len: usize, scale: f32) -> Vec<f32> {
    (0..len)
        .map(|i| (((i * 37 + 11) % 23) as f32 - 11.0) / 11.0 * scale)
        .collect()
}

pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {i}: {a} differs from {e} by more than {tolerance}"
        );
    }
}
