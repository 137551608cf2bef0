//! Fused convolution decomposed into a sequence of simpler device calls.
//!
//! Each stage is its own stream command working in place on the output
//! tensor; stream ordering makes the sequence equivalent to the fused call.

use kiln_core::{
    ActivationMode, Device, DeviceSliceMut, GraphNode, MemoryManager, Operation, OperationBase,
    Result, Stream, TensorId, require_scratch,
};

use super::descriptors::ConvolutionAlgorithm;
use super::{ConvolutionSpec, DECOMPOSED, FusedTensors, kernel};
use crate::helpers::output;

pub struct DecomposedConvolutionOp {
    base: OperationBase,
    spec: ConvolutionSpec,
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

    Ok(Box::new(DecomposedConvolutionOp {
        base: OperationBase::new(node, DECOMPOSED, input_ids, output_ids),
        spec,
        algorithm,
    }))
}

impl DecomposedConvolutionOp {
    pub fn algorithm(&self) -> ConvolutionAlgorithm {
        self.algorithm
    }

    /// Number of stream commands issued per execution.
    pub fn stage_count(&self) -> usize {
        2 + usize::from(self.spec.has_add) + usize::from(self.spec.activation != ActivationMode::None)
    }
}

impl Operation for DecomposedConvolutionOp {
    fn base(&self) -> &OperationBase {
        &self.base
    }

    fn mutable_workspace_size(&self) -> usize {
        self.spec.geometry.workspace_size(self.algorithm)
    }

    fn execute(
        &self,
        stream: &Stream,
        memory: &MemoryManager,
        scratch: Option<&DeviceSliceMut>,
    ) -> Result<()> {
        let FusedTensors {
            data,
            filter,
            bias,
            add,
        } = FusedTensors::resolve(memory, &self.base, self.spec.has_add)?;
        let out = output(memory, &self.base)?;
        let scratch = match self.mutable_workspace_size() {
            0 => None,
            size => Some(require_scratch(&self.base, scratch, size)?.clone()),
        };

        let geometry = self.spec.geometry.clone();
        let algorithm = self.algorithm;
        let dst = out.clone();
        stream.enqueue(self.base.label("convolution"), move || {
            let y = kernel::convolve(
                &geometry,
                algorithm,
                &data.read::<f32>()?,
                &filter.read::<f32>()?,
                scratch.as_ref(),
            )?;
            dst.write(&y)
        })?;

        let geometry = self.spec.geometry.clone();
        let dst = out.clone();
        stream.enqueue(self.base.label("bias"), move || {
            let mut y = dst.read::<f32>()?;
            kernel::add_bias(&geometry, &mut y, &bias.read::<f32>()?);
            dst.write(&y)
        })?;

        if let Some(add) = add {
            let dst = out.clone();
            stream.enqueue(self.base.label("add"), move || {
                let mut y = dst.read::<f32>()?;
                kernel::add_residual(&mut y, &add.read::<f32>()?);
                dst.write(&y)
            })?;
        }

        let activation = self.spec.activation;
        if activation != ActivationMode::None {
            stream.enqueue(self.base.label(activation.name()), move || {
                let mut y = out.read::<f32>()?;
                kernel::activate(&mut y, activation);
                out.write(&y)
            })?;
        }
        Ok(())
    }
}
