//! Fused convolution through the device graph API.
//!
//! The whole `conv + bias [+ add] + activation` chain is compiled into one
//! execution plan whose descriptor lives in device memory. The descriptor is
//! uploaded once as the operation's immutable workspace and read back by the
//! kernel on every execution.

use kiln_core::{
    ActivationMode, Device, DeviceSliceMut, Error, GraphNode, ImmutableWorkspace, MemoryManager,
    NodeKind, Operation, OperationBase, Result, Stream, TensorId,
};

use super::descriptors::{ConvolutionAlgorithm, ConvolutionGeometry, GEOMETRY_WORDS};
use super::fused::fused_forward;
use super::{ConvolutionSpec, FusedTensors, GRAPH_API};
use crate::helpers::output;

pub struct GraphApiConvolutionOp {
    base: OperationBase,
    has_add: bool,
    plan: ImmutableWorkspace,
}

pub fn build(
    device: &Device,
    node: &GraphNode,
    input_ids: &[TensorId],
    output_ids: &[TensorId],
) -> Result<Box<dyn Operation>> {
    if !device.capabilities().graph_api {
        return Err(Error::Candidate(format!(
            "device '{}' does not expose the graph API",
            device.capabilities().name
        )));
    }
    if !matches!(node.kind, NodeKind::FusedConvolution(_)) {
        return Err(Error::Candidate(format!(
            "graph API plans only cover FusedConvolution, not {}",
            node.op_type()
        )));
    }
    let spec = ConvolutionSpec::from_node(node)?;

    let mut words = spec.geometry.to_words();
    words.push(activation_code(spec.activation));
    words.push(u32::from(spec.has_add));

    Ok(Box::new(GraphApiConvolutionOp {
        base: OperationBase::new(node, GRAPH_API, input_ids, output_ids),
        has_add: spec.has_add,
        plan: ImmutableWorkspace::from_u32(&words),
    }))
}

fn activation_code(mode: ActivationMode) -> u32 {
    match mode {
        ActivationMode::None => 0,
        ActivationMode::Relu => 1,
        ActivationMode::Sigmoid => 2,
        ActivationMode::Tanh => 3,
    }
}

fn activation_from_code(code: u32) -> Result<ActivationMode> {
    match code {
        0 => Ok(ActivationMode::None),
        1 => Ok(ActivationMode::Relu),
        2 => Ok(ActivationMode::Sigmoid),
        3 => Ok(ActivationMode::Tanh),
        other => Err(Error::Workspace(format!("unknown activation code {other}"))),
    }
}

impl Operation for GraphApiConvolutionOp {
    fn base(&self) -> &OperationBase {
        &self.base
    }

    fn immutable_workspace_size(&self) -> usize {
        self.plan.size()
    }

    fn set_immutable_workspace(&mut self, workspace: DeviceSliceMut, stream: &Stream) -> Result<()> {
        self.plan.upload(workspace, stream)
    }

    fn execute(
        &self,
        stream: &Stream,
        memory: &MemoryManager,
        _scratch: Option<&DeviceSliceMut>,
    ) -> Result<()> {
        let tensors = FusedTensors::resolve(memory, &self.base, self.has_add)?;
        let out = output(memory, &self.base)?;
        let plan = self.plan.slice()?.clone();

        stream.enqueue(self.base.label("plan"), move || {
            let words = plan.read::<u32>()?;
            if words.len() != GEOMETRY_WORDS + 2 {
                return Err(Error::Workspace(format!(
                    "execution plan of {} words is corrupt",
                    words.len()
                )));
            }
            let geometry = ConvolutionGeometry::from_words(&words[..GEOMETRY_WORDS])?;
            let activation = activation_from_code(words[GEOMETRY_WORDS])?;

            // The plan engine runs the implicit precomputed GEMM kernel without scratch
            let y = fused_forward(
                &geometry,
                ConvolutionAlgorithm::ImplicitPrecompGemm,
                activation,
                &tensors,
                None,
            )?;
            out.write(&y)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_codes() {
        for mode in [
            ActivationMode::None,
            ActivationMode::Relu,
            ActivationMode::Sigmoid,
            ActivationMode::Tanh,
        ] {
            assert_eq!(activation_from_code(activation_code(mode)).unwrap(), mode);
        }
        assert!(activation_from_code(9).is_err());
    }
}
