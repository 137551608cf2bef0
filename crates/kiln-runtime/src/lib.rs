//! Graph compiler and execution sequencer for kiln.
//!
//! This crate turns an optimized graph into a list of operations bound to
//! device memory, then runs them in order.
//!
//! # Architecture
//!
//! The runtime manages three main responsibilities:
//! 1. **Compilation** - Select a candidate for each node and place tensors
//! 2. **Memory** - Upload constants and workspaces once, give every request its own mutable block
//! 3. **Execution** - Enqueue operations in graph order and read back outputs
//!
//! # Example
//!
//! ```
//! use kiln_core::{DataType, Graph, NodeKind};
//! use kiln_runtime::{Runtime, Tensor};
//!
//! fn main() -> kiln_runtime::Result<()> {
//!     let mut graph = Graph::new("example");
//!     let x = graph.add_input("input", DataType::F32, &[2, 2]);
//!     let y = graph.add_output("output", DataType::F32, &[2, 2]);
//!     graph.add_node("relu", NodeKind::Relu, &[x], &[y])?;
//!
//!     let runtime = Runtime::default();
//!     let compiled = runtime.load_graph(&graph)?;
//!     let mut request = compiled.create_request()?;
//!
//!     let input = Tensor::from_vec(vec![1.0f32, -2.0, 3.0, -4.0], &[2, 2]);
//!     let outputs = request.run(&[("input", input)])?;
//!
//!     let result = outputs["output"].to_vec::<f32>()?;
//!     assert_eq!(result, vec![1.0, 0.0, 3.0, 0.0]);
//!     Ok(())
//! }
//! ```

mod compiler;
mod error;
mod executor;
mod runtime;
mod tensor;

// Public exports
pub use compiler::{CompileOptions, compile};
pub use error::{Result, RuntimeError};
pub use executor::{Binding, CompiledGraph, InferRequest};
pub use runtime::Runtime;
pub use tensor::{Element, Tensor};
