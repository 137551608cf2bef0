//! Runtime initialization and device management.

use std::sync::Arc;

use kiln_core::{Device, DeviceCapabilities, Graph, OperationRegistry};

use crate::compiler::{CompileOptions, compile};
use crate::error::Result;
use crate::executor::CompiledGraph;

/// Main entry point for loading graphs onto a device.
///
/// Holds the device and the registry used to select an implementation for
/// every node.
///
/// # Example
/// ```
/// # use kiln_runtime::Runtime;
/// # use kiln_core::DeviceCapabilities;
/// let runtime = Runtime::new(DeviceCapabilities::default());
/// assert!(runtime.registry().contains("FusedConvolution"));
/// ```
pub struct Runtime {
    device: Arc<Device>,
    registry: OperationRegistry,
    options: CompileOptions,
}

impl Runtime {
    /// Create a runtime with the built-in candidate registry.
    pub fn new(capabilities: DeviceCapabilities) -> Self {
        Self::with_registry(capabilities, kiln_operators::core_operation_registry())
    }

    /// Create a runtime with a caller-supplied registry.
    pub fn with_registry(capabilities: DeviceCapabilities, registry: OperationRegistry) -> Self {
        tracing::info!(?capabilities, op_types = registry.len(), "runtime created");
        Self {
            device: Arc::new(Device::new(capabilities)),
            registry,
            options: CompileOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Mutable access for registering additional candidates.
    pub fn registry_mut(&mut self) -> &mut OperationRegistry {
        &mut self.registry
    }

    /// Compile a graph and upload its immutable state.
    ///
    /// # Errors
    /// Returns an error if any node cannot be built or placed.
    pub fn load_graph(&self, graph: &Graph) -> Result<CompiledGraph> {
        compile(&self.device, graph, &self.registry, &self.options)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(DeviceCapabilities::default())
    }
}
