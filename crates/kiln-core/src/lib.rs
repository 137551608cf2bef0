//! Core device memory management, operation contract and dispatch registry for kiln.
//!
//! This crate provides the foundational abstractions that the other kiln crates depend on:
//! - Graph model handed over by the optimizer (`Graph`, `GraphNode`, `NodeKind`)
//! - Reference device with asynchronous in-order streams (`Device`, `Stream`)
//! - Memory blocks and the device memory manager (`MemoryBlock`, `MemoryManager`)
//! - The `Operation` contract and its workspace helpers
//! - Operation factory registry with prioritized candidate fallback

pub mod device;
pub mod graph;
pub mod memory;
pub mod operation;
pub mod registry;
pub mod types;

// Re-export commonly used types
pub use device::{
    Device, DeviceAllocation, DeviceCapabilities, DeviceSlice, DeviceSliceMut, Stream, StreamStats,
};
pub use graph::{
    ActivationMode, ConvolutionParams, FusedConvolutionParams, Graph, GraphNode, NodeEntry,
    NodeKind, TensorInfo, TensorKind,
};
pub use memory::{
    BlockKind, ImmutableBlockBuilder, MemoryBlock, MemoryManager, MemoryModel, MemoryModelBuilder,
    TensorSlot,
};
pub use operation::{ImmutableWorkspace, Operation, OperationBase, require_scratch};
pub use registry::{
    Arity, CandidateFailure, ElementTypeRule, NodePreconditions, OperationRegistry,
    UnsupportedOperation,
};
pub use types::{DataType, TensorDesc, TensorId};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for kiln-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The graph handed to the backend violates a node's preconditions
    /// (arity, element types, dangling identifiers).
    #[error("Malformed graph: {0}")]
    MalformedGraph(String),

    /// Every candidate implementation of a node failed to build.
    #[error(transparent)]
    Unsupported(#[from] UnsupportedOperation),

    /// A tensor identifier could not be resolved to device memory.
    #[error("Memory resolution failed for tensor {id}: {reason}")]
    MemoryResolution { id: TensorId, reason: String },

    /// A device-level failure: allocation, bounds, or a failing stream command.
    #[error("Device error: {0}")]
    Device(String),

    /// Workspace contract violated (double upload, missing or undersized buffer).
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// A candidate builder rejected the node.
    #[error("{0}")]
    Candidate(String),
}

impl Error {
    /// Whether this error came from executing device work rather than from compilation.
    pub fn is_runtime(&self) -> bool {
        matches!(self, Error::Device(_) | Error::Workspace(_))
    }
}
