//! Operation trait: the compiled, repeatedly invocable unit of device work.

use crate::device::{DeviceSlice, DeviceSliceMut, Stream};
use crate::graph::GraphNode;
use crate::memory::MemoryManager;
use crate::types::TensorId;
use crate::{Error, Result};

/// Identity and tensor bindings shared by every operation.
///
/// This is the metadata the `MemoryManager` resolves; operations own no
/// tensor memory, only the identifiers declared here.
#[derive(Debug, Clone)]
pub struct OperationBase {
    node_name: String,
    op_type: String,
    implementation: &'static str,
    input_ids: Vec<TensorId>,
    output_ids: Vec<TensorId>,
}

impl OperationBase {
    /// Bind `implementation` to `node` with the given identifiers.
    pub fn new(
        node: &GraphNode,
        implementation: &'static str,
        input_ids: &[TensorId],
        output_ids: &[TensorId],
    ) -> Self {
        Self::from_parts(
            &node.name,
            node.op_type(),
            implementation,
            input_ids.to_vec(),
            output_ids.to_vec(),
        )
    }

    pub fn from_parts(
        node_name: &str,
        op_type: &str,
        implementation: &'static str,
        input_ids: Vec<TensorId>,
        output_ids: Vec<TensorId>,
    ) -> Self {
        Self {
            node_name: node_name.to_string(),
            op_type: op_type.to_string(),
            implementation,
            input_ids,
            output_ids,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// Name of the candidate that built this operation.
    pub fn implementation(&self) -> &'static str {
        self.implementation
    }

    pub fn input_ids(&self) -> &[TensorId] {
        &self.input_ids
    }

    pub fn output_ids(&self) -> &[TensorId] {
        &self.output_ids
    }

    /// Label used for stream commands issued by this operation.
    pub fn label(&self, step: &str) -> String {
        format!("{}:{}:{step}", self.node_name, self.implementation)
    }
}

/// A device-side execution unit for one graph node.
///
/// Operations are built once when the graph is compiled and executed once
/// per inference. Lifecycle:
///
/// 1. a candidate builder constructs the operation;
/// 2. if `immutable_workspace_size()` is non-zero, `set_immutable_workspace`
///    is called exactly once to upload fixed metadata;
/// 3. `execute` is called any number of times.
///
/// `execute` only enqueues work on the stream and returns; completion is
/// observed by whoever synchronizes the stream. A failure at this stage is a
/// runtime failure of the current pass and never triggers fallback to
/// another candidate.
pub trait Operation: Send + Sync {
    /// Identity and tensor bindings.
    fn base(&self) -> &OperationBase;

    /// Bytes of fixed metadata to keep on the device.
    fn immutable_workspace_size(&self) -> usize {
        0
    }

    /// Upload fixed metadata into `workspace`. Called once, before the first `execute`.
    fn set_immutable_workspace(&mut self, _workspace: DeviceSliceMut, _stream: &Stream) -> Result<()> {
        Ok(())
    }

    /// Bytes of scratch needed per invocation. Contents are not preserved between calls.
    fn mutable_workspace_size(&self) -> usize {
        0
    }

    /// Resolve tensors through `memory` and enqueue the device work on `stream`.
    fn execute(
        &self,
        stream: &Stream,
        memory: &MemoryManager,
        scratch: Option<&DeviceSliceMut>,
    ) -> Result<()>;
}

/// Fixed per-operation metadata that is uploaded to the device exactly once.
#[derive(Debug, Default)]
pub struct ImmutableWorkspace {
    contents: Vec<u8>,
    device: Option<DeviceSlice>,
}

impl ImmutableWorkspace {
    pub fn new(contents: Vec<u8>) -> Self {
        Self {
            contents,
            device: None,
        }
    }

    /// Encode a list of `u32` parameters.
    pub fn from_u32(values: &[u32]) -> Self {
        Self::new(bytemuck::cast_slice(values).to_vec())
    }

    pub fn size(&self) -> usize {
        self.contents.len()
    }

    pub fn is_uploaded(&self) -> bool {
        self.device.is_some()
    }

    /// Enqueue the upload into `dst` and remember its location.
    pub fn upload(&mut self, dst: DeviceSliceMut, stream: &Stream) -> Result<()> {
        if self.device.is_some() {
            return Err(Error::Workspace(
                "immutable workspace is already set".to_string(),
            ));
        }
        if dst.len() < self.contents.len() {
            return Err(Error::Workspace(format!(
                "immutable workspace needs {} bytes but {} were provided",
                self.contents.len(),
                dst.len()
            )));
        }
        stream.upload(&dst, self.contents.clone())?;
        self.device = Some(dst.as_slice().sub_slice(0, self.contents.len())?);
        Ok(())
    }

    /// Device copy of the metadata.
    pub fn slice(&self) -> Result<&DeviceSlice> {
        self.device.as_ref().ok_or_else(|| {
            Error::Workspace("immutable workspace was never set".to_string())
        })
    }
}

/// Check that a scratch buffer of at least `required` bytes was provided.
pub fn require_scratch<'a>(
    op: &OperationBase,
    scratch: Option<&'a DeviceSliceMut>,
    required: usize,
) -> Result<&'a DeviceSliceMut> {
    match scratch {
        Some(buffer) if buffer.len() >= required => Ok(buffer),
        Some(buffer) => Err(Error::Workspace(format!(
            "'{}' needs {required} bytes of scratch but got {}",
            op.node_name(),
            buffer.len()
        ))),
        None => Err(Error::Workspace(format!(
            "'{}' needs {required} bytes of scratch but none was provided",
            op.node_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn test_workspace_uploads_once() {
        let device = Device::default();
        let stream = device.create_stream();
        let alloc = device.allocate(64, "ws").unwrap();

        let mut workspace = ImmutableWorkspace::from_u32(&[1, 2, 3]);
        assert_eq!(workspace.size(), 12);
        assert!(workspace.slice().is_err());

        workspace.upload(alloc.slice_mut(0, 16).unwrap(), &stream).unwrap();
        stream.synchronize().unwrap();
        assert_eq!(workspace.slice().unwrap().read::<u32>().unwrap(), vec![1, 2, 3]);

        let again = workspace.upload(alloc.slice_mut(16, 16).unwrap(), &stream);
        assert!(matches!(again, Err(Error::Workspace(_))));
        assert_eq!(stream.stats().uploads, 1);
        assert_eq!(stream.stats().bytes_uploaded, 12);
    }

    #[test]
    fn test_workspace_too_small() {
        let device = Device::default();
        let stream = device.create_stream();
        let alloc = device.allocate(8, "ws").unwrap();

        let mut workspace = ImmutableWorkspace::from_u32(&[1, 2, 3]);
        assert!(workspace.upload(alloc.slice_mut(0, 8).unwrap(), &stream).is_err());
        assert!(!workspace.is_uploaded());
    }

    #[test]
    fn test_require_scratch() {
        let device = Device::default();
        let alloc = device.allocate(32, "scratch").unwrap();
        let scratch = alloc.slice_mut(0, 32).unwrap();
        let base = OperationBase::from_parts("n", "T", "Impl", vec![], vec![]);

        assert!(require_scratch(&base, Some(&scratch), 32).is_ok());
        assert!(require_scratch(&base, Some(&scratch), 33).is_err());
        assert!(require_scratch(&base, None, 1).is_err());
    }
}
