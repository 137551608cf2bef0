//! Reference operation implementations for kiln.
//!
//! Every node type is served by one or more candidate builders registered in
//! an `OperationRegistry`. Candidates are ordered by priority; the first one
//! that builds for a given node becomes its `Operation`.
//!
//! # Operation Families
//!
//! - **Binary elementwise**: Add, Subtract, Multiply, Less, Greater
//! - **Unary elementwise**: Relu, Sigmoid, Tanh
//!
//! # Individual Operations
//!
//! - Convolution family (Convolution, FusedConvolution, FusedGroupConvolution)
//!   with graph-API, single-call and decomposed candidates
//! - Concat

pub mod families;
pub mod operators;

mod helpers;
mod registry;

pub use families::{BinaryElementwiseOp, UnaryElementwiseOp};
pub use operators::convolution::{ConvolutionAlgorithm, ConvolutionGeometry, ConvolutionSpec};
pub use registry::core_operation_registry;

pub use kiln_core::{Error, Result};
