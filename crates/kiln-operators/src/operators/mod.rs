//! Individual operations that don't fit into families.

pub mod concat;
pub mod convolution;

pub use concat::ConcatOp;
pub use convolution::decomposed::DecomposedConvolutionOp;
pub use convolution::fused::FusedConvolutionOp;
pub use convolution::graph_api::GraphApiConvolutionOp;
pub use convolution::plain::ConvolutionOp;
