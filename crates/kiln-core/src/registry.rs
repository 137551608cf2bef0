//! Operation factory registry with prioritized candidate fallback.

use crate::device::Device;
use crate::graph::GraphNode;
use crate::operation::Operation;
use crate::types::TensorId;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;

/// Builds an operation for one node, or explains why it cannot.
///
/// Arguments are the device context, the node metadata, and the identifiers
/// bound to the node's input and output ports.
pub type CandidateBuilder = Box<
    dyn Fn(&Device, &GraphNode, &[TensorId], &[TensorId]) -> Result<Box<dyn Operation>>
        + Send
        + Sync,
>;

struct Candidate {
    name: String,
    priority: i32,
    builder: CandidateBuilder,
}

/// Allowed number of ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    /// Inclusive range.
    Range(usize, usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == n,
            Arity::Range(min, max) => (min..=max).contains(&count),
            Arity::AtLeast(min) => count >= min,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "exactly {n}"),
            Arity::Range(min, max) => write!(f, "between {min} and {max}"),
            Arity::AtLeast(min) => write!(f, "at least {min}"),
        }
    }
}

/// Element-type agreement required between ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElementTypeRule {
    #[default]
    Any,
    /// Every input and output has the same element type.
    AllEqual,
    /// Inputs agree with each other; outputs are unconstrained.
    InputsEqual,
}

/// Structural checks run once per node before any candidate is tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePreconditions {
    pub inputs: Arity,
    pub outputs: Arity,
    pub element_types: ElementTypeRule,
}

impl NodePreconditions {
    pub fn new(inputs: Arity, outputs: Arity) -> Self {
        Self {
            inputs,
            outputs,
            element_types: ElementTypeRule::Any,
        }
    }

    pub fn with_element_types(mut self, rule: ElementTypeRule) -> Self {
        self.element_types = rule;
        self
    }

    /// Check `node` against these preconditions.
    pub fn check(&self, node: &GraphNode) -> Result<()> {
        if !self.inputs.accepts(node.input_count()) {
            return Err(Error::MalformedGraph(format!(
                "{} node '{}' expects {} inputs, got {}",
                node.op_type(),
                node.name,
                self.inputs,
                node.input_count()
            )));
        }
        if !self.outputs.accepts(node.output_count()) {
            return Err(Error::MalformedGraph(format!(
                "{} node '{}' expects {} outputs, got {}",
                node.op_type(),
                node.name,
                self.outputs,
                node.output_count()
            )));
        }

        let ports: Vec<_> = match self.element_types {
            ElementTypeRule::Any => return Ok(()),
            ElementTypeRule::AllEqual => node.inputs.iter().chain(&node.outputs).collect(),
            ElementTypeRule::InputsEqual => node.inputs.iter().collect(),
        };
        if let Some(first) = ports.first() {
            if let Some(other) = ports.iter().find(|d| d.dtype != first.dtype) {
                return Err(Error::MalformedGraph(format!(
                    "{} node '{}' mixes element types {} and {}",
                    node.op_type(),
                    node.name,
                    first.dtype,
                    other.dtype
                )));
            }
        }
        Ok(())
    }
}

/// One candidate's failure reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub candidate: String,
    pub reason: String,
}

/// Every candidate registered for a node failed to build.
#[derive(Debug, Clone)]
pub struct UnsupportedOperation {
    pub node: String,
    pub op_type: String,
    /// Failures in trial order. Empty if nothing was registered.
    pub attempts: Vec<CandidateFailure>,
}

impl fmt::Display for UnsupportedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return write!(
                f,
                "Unsupported operation {} (node '{}'): no candidates registered",
                self.op_type, self.node
            );
        }
        write!(
            f,
            "Unsupported operation {} (node '{}'): all {} candidates failed",
            self.op_type,
            self.node,
            self.attempts.len()
        )?;
        for attempt in &self.attempts {
            write!(f, "\n  {}: {}", attempt.candidate, attempt.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for UnsupportedOperation {}

/// Registry mapping node types to prioritized candidate builders.
///
/// # Example
///
/// ```ignore
/// let mut registry = OperationRegistry::new();
/// registry
///     .register("Add", "ElementwiseContiguous", 200, build_contiguous)
///     .register("Add", "ElementwiseBroadcast", 100, build_broadcast);
///
/// let op = registry.build(&device, &node, &inputs, &outputs)?;
/// ```
#[derive(Default)]
pub struct OperationRegistry {
    candidates: HashMap<String, Vec<Candidate>>,
    preconditions: HashMap<String, NodePreconditions>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a candidate builder for `op_type`.
    ///
    /// Higher priorities are tried first; equal priorities keep registration order.
    pub fn register<F>(&mut self, op_type: &str, name: &str, priority: i32, builder: F) -> &mut Self
    where
        F: Fn(&Device, &GraphNode, &[TensorId], &[TensorId]) -> Result<Box<dyn Operation>>
            + Send
            + Sync
            + 'static,
    {
        let list = self.candidates.entry(op_type.to_string()).or_default();
        list.push(Candidate {
            name: name.to_string(),
            priority,
            builder: Box::new(builder),
        });
        // Stable sort keeps registration order among equal priorities
        list.sort_by_key(|c| std::cmp::Reverse(c.priority));
        self
    }

    /// Attach structural checks to `op_type`.
    pub fn set_preconditions(&mut self, op_type: &str, preconditions: NodePreconditions) -> &mut Self {
        self.preconditions
            .insert(op_type.to_string(), preconditions);
        self
    }

    pub fn preconditions(&self, op_type: &str) -> Option<&NodePreconditions> {
        self.preconditions.get(op_type)
    }

    /// Candidate names for `op_type` in trial order.
    pub fn candidates(&self, op_type: &str) -> Vec<&str> {
        self.candidates
            .get(op_type)
            .map(|list| list.iter().map(|c| c.name.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.candidates.contains_key(op_type)
    }

    /// Number of registered node types.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Registered node types, sorted.
    pub fn op_types(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.candidates.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Build the first candidate for `node` that succeeds.
    ///
    /// Preconditions are checked once, before any candidate runs, and a
    /// violation is reported as `Error::MalformedGraph`. A candidate that
    /// finds the node itself malformed ends the search with that error. Any
    /// other candidate failure is recorded and the next candidate is tried. If every candidate fails
    /// the result is `Error::Unsupported` naming each attempt.
    pub fn build(
        &self,
        device: &Device,
        node: &GraphNode,
        input_ids: &[TensorId],
        output_ids: &[TensorId],
    ) -> Result<Box<dyn Operation>> {
        let op_type = node.op_type();

        if input_ids.len() != node.input_count() || output_ids.len() != node.output_count() {
            return Err(Error::MalformedGraph(format!(
                "{op_type} node '{}' binds {} inputs and {} outputs but declares {} and {}",
                node.name,
                input_ids.len(),
                output_ids.len(),
                node.input_count(),
                node.output_count()
            )));
        }
        if let Some(preconditions) = self.preconditions.get(op_type) {
            preconditions.check(node)?;
        }

        let candidates = self.candidates.get(op_type).map(Vec::as_slice).unwrap_or(&[]);
        let mut attempts = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            match (candidate.builder)(device, node, input_ids, output_ids) {
                Ok(op) => {
                    tracing::debug!(
                        node = %node.name,
                        op_type,
                        candidate = %candidate.name,
                        rejected = attempts.len(),
                        "selected candidate"
                    );
                    return Ok(op);
                }
                // A graph defect is not a candidate limitation; no other candidate can fix it
                Err(e @ Error::MalformedGraph(_)) => {
                    tracing::debug!(
                        node = %node.name,
                        op_type,
                        candidate = %candidate.name,
                        error = %e,
                        "candidate found malformed node"
                    );
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(
                        node = %node.name,
                        op_type,
                        candidate = %candidate.name,
                        error = %e,
                        "candidate rejected"
                    );
                    attempts.push(CandidateFailure {
                        candidate: candidate.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(Error::Unsupported(UnsupportedOperation {
            node: node.name.clone(),
            op_type: op_type.to_string(),
            attempts,
        }))
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for op_type in self.op_types() {
            map.entry(&op_type, &self.candidates(op_type));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryManager;
    use crate::operation::OperationBase;
    use crate::device::{DeviceSliceMut, Stream};
    use crate::graph::NodeKind;
    use crate::types::{DataType, TensorDesc};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockOp {
        base: OperationBase,
    }

    impl Operation for MockOp {
        fn base(&self) -> &OperationBase {
            &self.base
        }

        fn execute(&self, _: &Stream, _: &MemoryManager, _: Option<&DeviceSliceMut>) -> Result<()> {
            Ok(())
        }
    }

    fn succeed(
        name: &'static str,
    ) -> impl Fn(&Device, &GraphNode, &[TensorId], &[TensorId]) -> Result<Box<dyn Operation>> + Send + Sync
    {
        move |_, node, inputs, outputs| {
            Ok(Box::new(MockOp {
                base: OperationBase::new(node, name, inputs, outputs),
            }) as Box<dyn Operation>)
        }
    }

    fn fail(
        reason: &'static str,
    ) -> impl Fn(&Device, &GraphNode, &[TensorId], &[TensorId]) -> Result<Box<dyn Operation>> + Send + Sync
    {
        move |_, _, _, _| Err(Error::Candidate(reason.to_string()))
    }

    fn relu_node(inputs: usize) -> GraphNode {
        let desc = TensorDesc::new(DataType::F32, &[4]);
        GraphNode::new("relu0", NodeKind::Relu, vec![desc.clone(); inputs], vec![desc])
    }

    fn ids(n: u32) -> Vec<TensorId> {
        (0..n).map(TensorId).collect()
    }

    #[test]
    fn test_falls_back_to_next_candidate() {
        let mut registry = OperationRegistry::new();
        registry
            .register("Relu", "Fast", 10, fail("fast path unavailable"))
            .register("Relu", "Slow", 1, succeed("Slow"));

        let op = registry
            .build(&Device::default(), &relu_node(1), &ids(1), &[TensorId(1)])
            .unwrap();
        assert_eq!(op.base().implementation(), "Slow");
        assert_eq!(op.base().input_ids(), &[TensorId(0)]);
    }

    #[test]
    fn test_malformed_node_stops_candidate_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut registry = OperationRegistry::new();
        registry
            .register("Relu", "Fast", 10, fail("fast path unavailable"))
            .register("Relu", "Checked", 5, |_, _, _, _| {
                Err(Error::MalformedGraph("bias length mismatch".to_string()))
            })
            .register("Relu", "Slow", 1, move |_, _, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Candidate("should not run".to_string()))
            });

        let err = registry
            .build(&Device::default(), &relu_node(1), &ids(1), &[TensorId(1)])
            .err()
            .unwrap();
        assert!(matches!(err, Error::MalformedGraph(_)), "got {err:?}");
        assert!(err.to_string().contains("bias length mismatch"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_first_success_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut registry = OperationRegistry::new();
        registry
            .register("Relu", "Preferred", 5, succeed("Preferred"))
            .register("Relu", "Fallback", 1, move |_, _, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Candidate("should not run".to_string()))
            });

        let op = registry
            .build(&Device::default(), &relu_node(1), &ids(1), &[TensorId(1)])
            .unwrap();
        assert_eq!(op.base().implementation(), "Preferred");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_priority_order_independent_of_registration() {
        let mut registry = OperationRegistry::new();
        registry
            .register("Relu", "Low", 1, succeed("Low"))
            .register("Relu", "High", 100, succeed("High"))
            .register("Relu", "MidA", 50, succeed("MidA"))
            .register("Relu", "MidB", 50, succeed("MidB"));

        assert_eq!(registry.candidates("Relu"), vec!["High", "MidA", "MidB", "Low"]);
        let op = registry
            .build(&Device::default(), &relu_node(1), &ids(1), &[TensorId(1)])
            .unwrap();
        assert_eq!(op.base().implementation(), "High");
    }

    #[test]
    fn test_all_failures_aggregated() {
        let mut registry = OperationRegistry::new();
        registry
            .register("Relu", "A", 3, fail("reason a"))
            .register("Relu", "B", 2, fail("reason b"))
            .register("Relu", "C", 1, fail("reason c"));

        let err = registry
            .build(&Device::default(), &relu_node(1), &ids(1), &[TensorId(1)])
            .err()
            .unwrap();
        let Error::Unsupported(unsupported) = &err else {
            panic!("expected Unsupported, got {err:?}");
        };
        assert_eq!(unsupported.attempts.len(), 3);
        assert_eq!(unsupported.attempts[0].candidate, "A");

        let message = err.to_string();
        for part in ["A: reason a", "B: reason b", "C: reason c", "relu0"] {
            assert!(message.contains(part), "missing {part:?} in {message}");
        }
    }

    #[test]
    fn test_no_candidates_is_unsupported() {
        let registry = OperationRegistry::new();
        let err = registry
            .build(&Device::default(), &relu_node(1), &ids(1), &[TensorId(1)])
            .err()
            .unwrap();
        assert!(matches!(&err, Error::Unsupported(u) if u.attempts.is_empty()));
        assert!(err.to_string().contains("no candidates registered"));
    }

    #[test]
    fn test_preconditions_checked_before_candidates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut registry = OperationRegistry::new();
        registry
            .register("Relu", "Only", 1, move |_, node, i, o| {
                counter.fetch_add(1, Ordering::SeqCst);
                succeed("Only")(&Device::default(), node, i, o)
            })
            .set_preconditions("Relu", NodePreconditions::new(Arity::Exact(1), Arity::Exact(1)));

        let err = registry
            .build(&Device::default(), &relu_node(2), &ids(2), &[TensorId(2)])
            .err()
            .unwrap();
        assert!(matches!(err, Error::MalformedGraph(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_identifier_count_must_match_ports() {
        let mut registry = OperationRegistry::new();
        registry.register("Relu", "Only", 1, succeed("Only"));

        let err = registry
            .build(&Device::default(), &relu_node(1), &ids(2), &[TensorId(2)])
            .err()
            .unwrap();
        assert!(matches!(err, Error::MalformedGraph(_)));
    }

    #[test]
    fn test_element_type_rules() {
        let node = GraphNode::new(
            "less",
            NodeKind::Less,
            vec![TensorDesc::new(DataType::F32, &[2]); 2],
            vec![TensorDesc::new(DataType::Bool, &[2])],
        );
        let compare = NodePreconditions::new(Arity::Exact(2), Arity::Exact(1));

        assert!(compare.with_element_types(ElementTypeRule::InputsEqual).check(&node).is_ok());
        assert!(compare.with_element_types(ElementTypeRule::AllEqual).check(&node).is_err());

        let mut mixed = node.clone();
        mixed.inputs[1].dtype = DataType::I32;
        assert!(compare.with_element_types(ElementTypeRule::InputsEqual).check(&mixed).is_err());
    }

    #[test]
    fn test_arity() {
        assert!(Arity::Range(3, 4).accepts(3));
        assert!(Arity::Range(3, 4).accepts(4));
        assert!(!Arity::Range(3, 4).accepts(5));
        assert!(Arity::AtLeast(1).accepts(7));
        assert!(!Arity::AtLeast(1).accepts(0));
    }
}
