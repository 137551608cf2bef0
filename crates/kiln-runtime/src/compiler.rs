//! Lowers an optimized graph into operations bound to device memory.
//!
//! Compilation runs once per graph:
//! 1. **Placement** - constants go to the shared immutable block, every other
//!    tensor gets a slot in the mutable memory model
//! 2. **Candidate selection** - each node is built through the registry
//! 3. **Validation** - every operation's tensor identifiers must resolve
//! 4. **Workspace upload** - immutable workspaces are packed into one frozen
//!    allocation and uploaded before the graph is accepted

use std::sync::Arc;

use kiln_core::{
    Device, DeviceAllocation, Graph, ImmutableBlockBuilder, MemoryManager, MemoryModelBuilder,
    Operation, OperationRegistry, TensorKind, memory::align_up,
};

use crate::error::Result;
use crate::executor::{Binding, CompiledGraph};

/// Options controlling how a graph is laid out in device memory.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Byte alignment of every tensor slot and workspace.
    pub alignment: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self { alignment: 256 }
    }
}

/// Compile `graph` for `device`, selecting one candidate per node.
///
/// # Errors
/// Returns the first node's failure: `MalformedGraph` for precondition
/// violations, `Unsupported` when every candidate was rejected, or a
/// device/workspace error while uploading immutable workspaces.
#[tracing::instrument(skip_all, fields(graph = %graph.name, num_nodes = graph.nodes().len()))]
pub fn compile(
    device: &Arc<Device>,
    graph: &Graph,
    registry: &OperationRegistry,
    options: &CompileOptions,
) -> Result<CompiledGraph> {
    let mut constants = ImmutableBlockBuilder::with_alignment(options.alignment);
    let mut layout = MemoryModelBuilder::with_alignment(options.alignment);
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
    let immutable = constants.build(device)?;
    let mutable_model = layout.build();
    tracing::debug!(
        immutable_bytes = immutable.size(),
        mutable_bytes = mutable_model.size(),
        "tensors placed"
    );

    // Used only to resolve identifiers; each request allocates its own mutable block
    let probe = MemoryManager::new(device, Arc::clone(&immutable), mutable_model.clone())?;

    let mut ops = Vec::with_capacity(graph.nodes().len());
    for entry in graph.nodes() {
        let _span = tracing::debug_span!("node", name = %entry.node.name, op_type = entry.node.op_type())
            .entered();
        let op = registry.build(device, &entry.node, &entry.inputs, &entry.outputs)?;
        probe.validate(op.base())?;
        ops.push(op);
    }
    drop(probe);

    let workspaces = upload_workspaces(device, &mut ops, options.alignment)?;
    let scratch_size = ops
        .iter()
        .map(|op| op.mutable_workspace_size())
        .max()
        .unwrap_or(0);

    let bind = |kind: TensorKind| -> Vec<Binding> {
        graph
            .tensors()
            .filter(|(_, info)| info.kind == kind)
            .map(|(id, info)| Binding {
                name: info.name.clone(),
                id,
                desc: info.desc.clone(),
            })
            .collect()
    };
    let inputs = bind(TensorKind::Input);
    let outputs = bind(TensorKind::Output);

    tracing::debug!(
        ops = ops.len(),
        workspace_bytes = workspaces.as_ref().map_or(0, |w| w.size()),
        scratch_size,
        "graph compiled"
    );

    Ok(CompiledGraph::new(
        graph.name.clone(),
        Arc::clone(device),
        ops,
        immutable,
        mutable_model,
        workspaces,
        scratch_size,
        inputs,
        outputs,
    ))
}

/// Pack every immutable workspace into one allocation, upload each exactly
/// once, wait for the uploads and freeze the allocation.
fn upload_workspaces(
    device: &Device,
    ops: &mut [Box<dyn Operation>],
    alignment: usize,
) -> Result<Option<Arc<DeviceAllocation>>> {
    let total: usize = ops
        .iter()
        .map(|op| align_up(op.immutable_workspace_size(), alignment))
        .sum();
    if total == 0 {
        return Ok(None);
    }

    let allocation = device.allocate(total, "immutable workspaces")?;
    let stream = device.create_stream();
    let mut offset = 0;
    for op in ops.iter_mut() {
        let size = op.immutable_workspace_size();
        if size == 0 {
            continue;
        }
        let slice = allocation.slice_mut(offset, size)?;
        op.set_immutable_workspace(slice, &stream)?;
        offset += align_up(size, alignment);
    }
    stream.synchronize()?;
    allocation.freeze();

    let stats = stream.stats();
    tracing::debug!(
        uploads = stats.uploads,
        bytes = stats.bytes_uploaded,
        "immutable workspaces uploaded"
    );
    Ok(Some(allocation))
}
