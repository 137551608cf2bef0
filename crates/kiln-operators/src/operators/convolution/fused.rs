//! Single-call fused convolution: conv, bias, residual add and activation in one kernel.

use kiln_core::{
    ActivationMode, Device, DeviceSliceMut, Error, GraphNode, MemoryManager, Operation,
    OperationBase, Result, Stream, TensorId, require_scratch,
};

use super::descriptors::{ConvolutionAlgorithm, ConvolutionGeometry};
use super::{ConvolutionSpec, FusedTensors, SINGLE_CALL, kernel};
use crate::helpers::output;

pub struct FusedConvolutionOp {
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

    // The fused entry point only honors an identity activation with implicit precomputed GEMM
    if spec.activation == ActivationMode::None
        && algorithm != ConvolutionAlgorithm::ImplicitPrecompGemm
    {
        return Err(Error::Candidate(format!(
            "unsupported parameter combination: activation {} with {algorithm} algorithm",
            spec.activation.name()
        )));
    }

    Ok(Box::new(FusedConvolutionOp {
        base: OperationBase::new(node, SINGLE_CALL, input_ids, output_ids),
        spec,
        algorithm,
    }))
}

/// Full fused forward pass on host-resident values.
pub(super) fn fused_forward(
    geometry: &ConvolutionGeometry,
    algorithm: ConvolutionAlgorithm,
    activation: ActivationMode,
    tensors: &FusedTensors,
    scratch: Option<&DeviceSliceMut>,
) -> Result<Vec<f32>> {
    let mut y = kernel::convolve(
        geometry,
        algorithm,
        &tensors.data.read::<f32>()?,
        &tensors.filter.read::<f32>()?,
        scratch,
    )?;
    kernel::add_bias(geometry, &mut y, &tensors.bias.read::<f32>()?);
    if let Some(add) = &tensors.add {
        kernel::add_residual(&mut y, &add.read::<f32>()?);
    }
    kernel::activate(&mut y, activation);
    Ok(y)
}

impl FusedConvolutionOp {
    pub fn algorithm(&self) -> ConvolutionAlgorithm {
        self.algorithm
    }
}

impl Operation for FusedConvolutionOp {
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
        let tensors = FusedTensors::resolve(memory, &self.base, self.spec.has_add)?;
        let out = output(memory, &self.base)?;
        let scratch = match self.mutable_workspace_size() {
            0 => None,
            size => Some(require_scratch(&self.base, scratch, size)?.clone()),
        };
        let geometry = self.spec.geometry.clone();
        let activation = self.spec.activation;
        let algorithm = self.algorithm;

        stream.enqueue(self.base.label("fused"), move || {
            let y = fused_forward(&geometry, algorithm, activation, &tensors, scratch.as_ref())?;
            out.write(&y)
        })
    }
}
