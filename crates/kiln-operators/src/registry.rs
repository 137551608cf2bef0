//! Core operation registry.

use kiln_core::{Arity, ElementTypeRule, NodePreconditions, OperationRegistry};

use crate::families::{BinaryElementwiseOp, UnaryElementwiseOp};
use crate::operators::{concat, convolution};

/// Returns a registry populated with every built-in candidate.
///
/// The registry includes:
/// - 5 binary elementwise operations (Add, Subtract, Multiply, Less, Greater)
/// - 3 unary elementwise operations (Relu, Sigmoid, Tanh)
/// - the convolution family (Convolution, FusedConvolution, FusedGroupConvolution)
/// - Concat
///
/// Custom candidates can be added to the returned registry via
/// `registry.register(op_type, name, priority, builder)`.
pub fn core_operation_registry() -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    let binary = NodePreconditions::new(Arity::Exact(2), Arity::Exact(1));
    let unary = NodePreconditions::new(Arity::Exact(1), Arity::Exact(1))
        .with_element_types(ElementTypeRule::AllEqual);

    // Binary elementwise operations
    for op in [
        BinaryElementwiseOp::add(),
        BinaryElementwiseOp::subtract(),
        BinaryElementwiseOp::multiply(),
        BinaryElementwiseOp::less(),
        BinaryElementwiseOp::greater(),
    ] {
        let rule = if op.is_comparison() {
            ElementTypeRule::InputsEqual
        } else {
            ElementTypeRule::AllEqual
        };
        registry.set_preconditions(op.name(), binary.with_element_types(rule));
        op.register(&mut registry);
    }

    // Unary elementwise operations
    for op in [
        UnaryElementwiseOp::relu(),
        UnaryElementwiseOp::sigmoid(),
        UnaryElementwiseOp::tanh(),
    ] {
        registry.set_preconditions(op.name(), unary);
        op.register(&mut registry);
    }

    // Convolution family
    registry.set_preconditions(
        "Convolution",
        NodePreconditions::new(Arity::Exact(2), Arity::Exact(1))
            .with_element_types(ElementTypeRule::AllEqual),
    );
    for op_type in convolution::FUSED_OP_TYPES {
        // data, filter, bias and an optional residual add
        registry.set_preconditions(
            op_type,
            NodePreconditions::new(Arity::Range(3, 4), Arity::Exact(1))
                .with_element_types(ElementTypeRule::AllEqual),
        );
    }
    convolution::register(&mut registry);

    registry
        .set_preconditions(
            "Concat",
            NodePreconditions::new(Arity::AtLeast(1), Arity::Exact(1))
                .with_element_types(ElementTypeRule::AllEqual),
        )
        .register("Concat", concat::CONCAT, 100, concat::build);

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_registry_contents() {
        let registry = core_operation_registry();
        assert_eq!(
            registry.op_types(),
            vec![
                "Add",
                "Concat",
                "Convolution",
                "FusedConvolution",
                "FusedGroupConvolution",
                "Greater",
                "Less",
                "Multiply",
                "Relu",
                "Sigmoid",
                "Subtract",
                "Tanh",
            ]
        );
        assert_eq!(
            registry.candidates("FusedConvolution"),
            vec![
                "FusedConvolutionGraphApi",
                "FusedConvolutionSingleCall",
                "FusedConvolutionDecomposed",
            ]
        );
        assert_eq!(
            registry.candidates("Add"),
            vec!["ElementwiseContiguous", "ElementwiseBroadcast"]
        );
        assert!(registry.preconditions("Less").is_some());
    }
}
