//! Collapsed operation families.
//!
//! Each family implements the shared candidate logic once and is
//! parameterized only by the element function.

pub mod binary_elementwise;
pub mod unary_elementwise;

pub use binary_elementwise::BinaryElementwiseOp;
pub use unary_elementwise::UnaryElementwiseOp;
