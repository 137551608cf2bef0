//! Unary elementwise operation family.
//!
//! Covers: Relu, Sigmoid, Tanh

use kiln_core::{
    ActivationMode, DeviceSliceMut, Error, GraphNode, MemoryManager, Operation, OperationBase,
    OperationRegistry, Result, Stream, TensorId,
};

use crate::helpers::{inputs, output, require_f32};

pub const UNARY: &str = "ElementwiseUnary";

/// Unary elementwise operation family, parameterized by the activation it applies.
#[derive(Clone, Copy)]
pub struct UnaryElementwiseOp {
    name: &'static str,
    activation: ActivationMode,
}

impl UnaryElementwiseOp {
    pub fn relu() -> Self {
        Self {
            name: "Relu",
            activation: ActivationMode::Relu,
        }
    }

    pub fn sigmoid() -> Self {
        Self {
            name: "Sigmoid",
            activation: ActivationMode::Sigmoid,
        }
    }

    pub fn tanh() -> Self {
        Self {
            name: "Tanh",
            activation: ActivationMode::Tanh,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn register(self, registry: &mut OperationRegistry) {
        registry.register(self.name, UNARY, 100, move |_, node, i, o| {
            self.build(node, i, o)
        });
    }

    pub fn build(
        &self,
        node: &GraphNode,
        input_ids: &[TensorId],
        output_ids: &[TensorId],
    ) -> Result<Box<dyn Operation>> {
        require_f32(node)?;
        let input = node.input(0)?;
        let out = node.output(0)?;
        if input.shape != out.shape {
            return Err(Error::Candidate(format!(
                "input shape {:?} differs from output shape {:?}",
                input.shape, out.shape
            )));
        }

        Ok(Box::new(UnaryOp {
            base: OperationBase::new(node, UNARY, input_ids, output_ids),
            activation: self.activation,
        }))
    }
}

struct UnaryOp {
    base: OperationBase,
    activation: ActivationMode,
}

impl Operation for UnaryOp {
    fn base(&self) -> &OperationBase {
        &self.base
    }

    fn execute(
        &self,
        stream: &Stream,
        memory: &MemoryManager,
        _scratch: Option<&DeviceSliceMut>,
    ) -> Result<()> {
        let [x] = inputs(memory, &self.base)?;
        let out = output(memory, &self.base)?;
        let activation = self.activation;

        stream.enqueue(self.base.label(activation.name()), move || {
            let values: Vec<f32> = x
                .read::<f32>()?
                .into_iter()
                .map(|v| activation.apply(v))
                .collect();
            out.write(&values)
        })
    }
}
