//! Convolution without fused epilogue.

use kiln_core::{
    Device, DeviceSliceMut, GraphNode, MemoryManager, Operation, OperationBase, Result, Stream,
    TensorId, require_scratch,
};

use super::descriptors::{ConvolutionAlgorithm, ConvolutionGeometry};
use super::{ConvolutionSpec, PLAIN, kernel};
use crate::helpers::{inputs, output};

pub struct ConvolutionOp {
    base: OperationBase,
    geometry: ConvolutionGeometry,
    algorithm: ConvolutionAlgorithm,
}

pub fn build(
    device: &Device,
    node: &GraphNode,
    input_ids: &[TensorId],
    output_ids: &[TensorId],
) -> Result<Box<dyn Operation>> {
    let spec = ConvolutionSpec::from_node(node)?;
    let algorithm = spec.geometry.select_algorithm(device.capabilities());

    Ok(Box::new(ConvolutionOp {
        base: OperationBase::new(node, PLAIN, input_ids, output_ids),
        geometry: spec.geometry,
        algorithm,
    }))
}

impl ConvolutionOp {
    pub fn algorithm(&self) -> ConvolutionAlgorithm {
        self.algorithm
    }
}

impl Operation for ConvolutionOp {
    fn base(&self) -> &OperationBase {
        &self.base
    }

    fn mutable_workspace_size(&self) -> usize {
        self.geometry.workspace_size(self.algorithm)
    }

    fn execute(
        &self,
        stream: &Stream,
        memory: &MemoryManager,
        scratch: Option<&DeviceSliceMut>,
    ) -> Result<()> {
        let [data, filter] = inputs(memory, &self.base)?;
        let out = output(memory, &self.base)?;
        let scratch = match self.mutable_workspace_size() {
            0 => None,
            size => Some(require_scratch(&self.base, scratch, size)?.clone()),
        };
        let geometry = self.geometry.clone();
        let algorithm = self.algorithm;

        stream.enqueue(self.base.label(algorithm.name()), move || {
            let y = kernel::convolve(
                &geometry,
                algorithm,
                &data.read::<f32>()?,
                &filter.read::<f32>()?,
                scratch.as_ref(),
            )?;
            out.write(&y)
        })
    }
}
