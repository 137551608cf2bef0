//! Execution sequencing for compiled graphs.
//!
//! A [`CompiledGraph`] owns the operations, the frozen immutable block and the
//! uploaded workspaces. It is cheap to clone and safe to share between
//! threads. Each [`InferRequest`] is one execution context: it owns its own
//! mutable block, stream and scratch buffer, so requests never contend for
//! memory and a failed pass leaves nothing behind for the next one.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kiln_core::{
    Device, DeviceAllocation, DeviceSliceMut, MemoryBlock, MemoryManager, MemoryModel, Operation,
    Stream, StreamStats, TensorDesc, TensorId,
};

use crate::error::{Result, RuntimeError};
use crate::tensor::Tensor;

/// A named graph input or output.
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: String,
    pub id: TensorId,
    pub desc: TensorDesc,
}

struct CompiledInner {
    name: String,
    device: Arc<Device>,
    ops: Vec<Box<dyn Operation>>,
    immutable: Arc<MemoryBlock>,
    mutable_model: MemoryModel,
    workspaces: Option<Arc<DeviceAllocation>>,
    scratch_size: usize,
    inputs: Vec<Binding>,
    outputs: Vec<Binding>,
}

/// A graph whose operations are built and whose immutable state is on the device.
#[derive(Clone)]
pub struct CompiledGraph {
    inner: Arc<CompiledInner>,
}

impl CompiledGraph {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        device: Arc<Device>,
        ops: Vec<Box<dyn Operation>>,
        immutable: Arc<MemoryBlock>,
        mutable_model: MemoryModel,
        workspaces: Option<Arc<DeviceAllocation>>,
        scratch_size: usize,
        inputs: Vec<Binding>,
        outputs: Vec<Binding>,
    ) -> Self {
        Self {
            inner: Arc::new(CompiledInner {
                name,
                device,
                ops,
                immutable,
                mutable_model,
                workspaces,
                scratch_size,
                inputs,
                outputs,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of operations in execution order.
    pub fn len(&self) -> usize {
        self.inner.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.ops.is_empty()
    }

    /// `(node name, selected candidate)` for every operation, in execution order.
    pub fn implementations(&self) -> Vec<(&str, &'static str)> {
        self.inner
            .ops
            .iter()
            .map(|op| (op.base().node_name(), op.base().implementation()))
            .collect()
    }

    pub fn inputs(&self) -> &[Binding] {
        &self.inner.inputs
    }

    pub fn outputs(&self) -> &[Binding] {
        &self.inner.outputs
    }

    /// The shared, frozen block holding constants.
    pub fn immutable_block(&self) -> &Arc<MemoryBlock> {
        &self.inner.immutable
    }

    /// Layout each request uses for its own mutable block.
    pub fn mutable_model(&self) -> &MemoryModel {
        &self.inner.mutable_model
    }

    /// The frozen allocation holding every operation's immutable workspace.
    pub fn workspace_allocation(&self) -> Option<&Arc<DeviceAllocation>> {
        self.inner.workspaces.as_ref()
    }

    /// Largest mutable workspace any operation requested.
    pub fn scratch_size(&self) -> usize {
        self.inner.scratch_size
    }

    /// Create a new execution context with its own mutable memory.
    ///
    /// # Errors
    /// Returns an error if the device cannot hold another mutable block.
    pub fn create_request(&self) -> Result<InferRequest> {
        let device = &self.inner.device;
        let memory = MemoryManager::new(
            device,
            Arc::clone(&self.inner.immutable),
            self.inner.mutable_model.clone(),
        )
        .map_err(RuntimeError::Device)?;
        let scratch = match self.inner.scratch_size {
            0 => None,
            size => Some(
                device
                    .allocate(size, "scratch")
                    .and_then(|alloc| alloc.slice_mut(0, size))
                    .map_err(RuntimeError::Device)?,
            ),
        };

        Ok(InferRequest {
            graph: Arc::clone(&self.inner),
            memory,
            stream: device.create_stream(),
            scratch,
            runs: 0,
        })
    }

    /// Run the graph once in a fresh execution context.
    pub fn run(&self, inputs: &[(&str, Tensor)]) -> Result<HashMap<String, Tensor>> {
        self.create_request()?.run(inputs)
    }
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("name", &self.inner.name)
            .field("ops", &self.inner.ops.len())
            .field("scratch_size", &self.inner.scratch_size)
            .finish_non_exhaustive()
    }
}

/// One execution context of a compiled graph.
///
/// Operations are dispatched strictly in graph order onto the request's
/// stream. Once an operation is selected it is never swapped for another
/// candidate: a failure during execution is reported, not retried.
pub struct InferRequest {
    graph: Arc<CompiledInner>,
    memory: MemoryManager,
    stream: Stream,
    scratch: Option<DeviceSliceMut>,
    runs: u64,
}

impl InferRequest {
    /// Execute the graph with named inputs, returning named outputs.
    ///
    /// # Errors
    /// - `TensorNotFound` for an input name the graph does not declare
    /// - `InvalidInputOutput` for a missing input or a type/shape mismatch
    /// - `Execution` when an operation fails to enqueue its work
    /// - `Device` when a queued command fails
    pub fn run(&mut self, inputs: &[(&str, Tensor)]) -> Result<HashMap<String, Tensor>> {
        let _span = tracing::debug_span!("run", graph = %self.graph.name, run = self.runs).entered();
        self.runs += 1;

        if let Err(err) = self.dispatch(inputs) {
            let dropped = self.stream.discard();
            tracing::warn!(error = %err, dropped, "inference pass failed");
            return Err(err);
        }

        if let Err(err) = self.stream.synchronize() {
            tracing::warn!(error = %err, "device stream failed");
            return Err(RuntimeError::Device(err));
        }

        let mut outputs = HashMap::with_capacity(self.graph.outputs.len());
        for binding in &self.graph.outputs {
            let bytes = self
                .memory
                .read_tensor(binding.id)
                .map_err(RuntimeError::Device)?;
            let tensor = Tensor::from_raw(bytes, &binding.desc.shape, binding.desc.dtype)?;
            outputs.insert(binding.name.clone(), tensor);
        }

        tracing::debug!(outputs = outputs.len(), "inference pass complete");
        Ok(outputs)
    }

    /// Upload inputs and enqueue every operation.
    fn dispatch(&self, inputs: &[(&str, Tensor)]) -> Result<()> {
        for (name, tensor) in inputs {
            let binding = self
                .graph
                .inputs
                .iter()
                .find(|b| b.name == *name)
                .ok_or_else(|| {
                    RuntimeError::TensorNotFound(format!("Input '{name}' not found in graph"))
                })?;
            if tensor.desc() != binding.desc {
                return Err(RuntimeError::InvalidInputOutput(format!(
                    "input '{name}' is {}{:?}, graph expects {}{:?}",
                    tensor.dtype(),
                    tensor.shape(),
                    binding.desc.dtype,
                    binding.desc.shape
                )));
            }
            let dst = self
                .memory
                .output_tensor(binding.id)
                .map_err(RuntimeError::Device)?;
            self.stream
                .upload(&dst, tensor.as_bytes().to_vec())
                .map_err(RuntimeError::Device)?;
        }

        if let Some(missing) = self
            .graph
            .inputs
            .iter()
            .find(|b| !inputs.iter().any(|(name, _)| *name == b.name))
        {
            return Err(RuntimeError::InvalidInputOutput(format!(
                "missing input '{}'",
                missing.name
            )));
        }

        for op in &self.graph.ops {
            op.execute(&self.stream, &self.memory, self.scratch.as_ref())
                .map_err(|source| RuntimeError::Execution {
                    op: op.base().node_name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Memory manager of this context.
    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Counters of this context's stream.
    pub fn stream_stats(&self) -> StreamStats {
        self.stream.stats()
    }

    /// Completed or attempted passes.
    pub fn runs(&self) -> u64 {
        self.runs
    }
}

impl fmt::Debug for InferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferRequest")
            .field("graph", &self.graph.name)
            .field("stream", &self.stream)
            .field("runs", &self.runs)
            .finish_non_exhaustive()
    }
}
