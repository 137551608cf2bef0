//! Binary elementwise operation family.
//!
//! Covers: Add, Subtract, Multiply, Less, Greater

use kiln_core::{
    DataType, DeviceSliceMut, Error, GraphNode, ImmutableWorkspace, MemoryManager,
    Operation, OperationBase, OperationRegistry, Result, Stream, TensorId,
};

use crate::helpers::{broadcast_shapes, broadcast_strides, inputs, output, require_f32};

/// Candidate for inputs that already have the output shape.
pub const CONTIGUOUS: &str = "ElementwiseContiguous";
/// Candidate that broadcasts through strides kept in an immutable workspace.
pub const BROADCAST: &str = "ElementwiseBroadcast";

#[derive(Clone, Copy)]
enum BinaryFn {
    Arithmetic(fn(f32, f32) -> f32),
    Comparison(fn(f32, f32) -> bool),
}

impl BinaryFn {
    fn output_type(self) -> DataType {
        match self {
            BinaryFn::Arithmetic(_) => DataType::F32,
            BinaryFn::Comparison(_) => DataType::Bool,
        }
    }

    /// Evaluate over `(a, b)` pairs and encode the result in the output type.
    fn evaluate(self, pairs: impl Iterator<Item = (f32, f32)>) -> Vec<u8> {
        match self {
            BinaryFn::Arithmetic(f) => {
                let values: Vec<f32> = pairs.map(|(a, b)| f(a, b)).collect();
                bytemuck::cast_slice(&values).to_vec()
            }
            BinaryFn::Comparison(f) => pairs.map(|(a, b)| f(a, b) as u8).collect(),
        }
    }
}

/// Binary elementwise operation family.
///
/// Every member registers the same two candidates: a contiguous kernel for
/// inputs whose shapes equal the output shape, and a broadcasting kernel
/// that reads its index strides from an immutable workspace. Comparisons
/// produce `Bool` outputs stored one byte per element.
#[derive(Clone, Copy)]
pub struct BinaryElementwiseOp {
    name: &'static str,
    func: BinaryFn,
}

impl BinaryElementwiseOp {
    pub fn add() -> Self {
        Self {
            name: "Add",
            func: BinaryFn::Arithmetic(|a, b| a + b),
        }
    }

    pub fn subtract() -> Self {
        Self {
            name: "Subtract",
            func: BinaryFn::Arithmetic(|a, b| a - b),
        }
    }

    pub fn multiply() -> Self {
        Self {
            name: "Multiply",
            func: BinaryFn::Arithmetic(|a, b| a * b),
        }
    }

    pub fn less() -> Self {
        Self {
            name: "Less",
            func: BinaryFn::Comparison(|a, b| a < b),
        }
    }

    pub fn greater() -> Self {
        Self {
            name: "Greater",
            func: BinaryFn::Comparison(|a, b| a > b),
        }
    }

    /// Node type served by this member.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_comparison(&self) -> bool {
        matches!(self.func, BinaryFn::Comparison(_))
    }

    /// Register both candidates under this member's node type.
    pub fn register(self, registry: &mut OperationRegistry) {
        registry
            .register(self.name, CONTIGUOUS, 200, move |_, node, i, o| {
                self.build_contiguous(node, i, o)
            })
            .register(self.name, BROADCAST, 100, move |_, node, i, o| {
                self.build_broadcast(node, i, o)
            });
    }

    fn check_types(&self, node: &GraphNode) -> Result<()> {
        require_f32(node)?;
        let out = node.output(0)?;
        let expected = self.func.output_type();
        if out.dtype != expected {
            return Err(Error::Candidate(format!(
                "{} produces {expected}, but the output is {}",
                self.name, out.dtype
            )));
        }
        Ok(())
    }

    pub fn build_contiguous(
        &self,
        node: &GraphNode,
        input_ids: &[TensorId],
        output_ids: &[TensorId],
    ) -> Result<Box<dyn Operation>> {
        self.check_types(node)?;
        let out = node.output(0)?;
        if let Some(desc) = node.inputs.iter().find(|d| d.shape != out.shape) {
            return Err(Error::Candidate(format!(
                "input shape {:?} differs from output shape {:?}",
                desc.shape, out.shape
            )));
        }

        Ok(Box::new(ContiguousBinary {
            base: OperationBase::new(node, CONTIGUOUS, input_ids, output_ids),
            func: self.func,
        }))
    }

    pub fn build_broadcast(
        &self,
        node: &GraphNode,
        input_ids: &[TensorId],
        output_ids: &[TensorId],
    ) -> Result<Box<dyn Operation>> {
        self.check_types(node)?;
        let a = &node.input(0)?.shape;
        let b = &node.input(1)?.shape;
        let out = node.output(0)?;

        let shape = broadcast_shapes(&[a, b])?;
        if shape != out.shape {
            return Err(Error::Candidate(format!(
                "broadcast shape {shape:?} differs from output shape {:?}",
                out.shape
            )));
        }

        let rank = shape.len();
        // Layout: [rank, out_shape, a_strides, b_strides]
        let mut meta: Vec<u32> = Vec::with_capacity(1 + 3 * rank);
        meta.push(rank as u32);
        meta.extend(shape.iter().map(|&d| d as u32));
        meta.extend(broadcast_strides(a, &shape).into_iter().map(|s| s as u32));
        meta.extend(broadcast_strides(b, &shape).into_iter().map(|s| s as u32));

        Ok(Box::new(BroadcastBinary {
            base: OperationBase::new(node, BROADCAST, input_ids, output_ids),
            func: self.func,
            rank,
            workspace: ImmutableWorkspace::from_u32(&meta),
        }))
    }
}

struct ContiguousBinary {
    base: OperationBase,
    func: BinaryFn,
}

impl Operation for ContiguousBinary {
    fn base(&self) -> &OperationBase {
        &self.base
    }

    fn execute(
        &self,
        stream: &Stream,
        memory: &MemoryManager,
        _scratch: Option<&DeviceSliceMut>,
    ) -> Result<()> {
        let [a, b] = inputs(memory, &self.base)?;
        let out = output(memory, &self.base)?;
        let func = self.func;

        stream.enqueue(self.base.label("kernel"), move || {
            let a = a.read::<f32>()?;
            let b = b.read::<f32>()?;
            out.write_bytes(&func.evaluate(a.into_iter().zip(b)))
        })
    }
}

struct BroadcastBinary {
    base: OperationBase,
    func: BinaryFn,
    rank: usize,
    workspace: ImmutableWorkspace,
}

impl Operation for BroadcastBinary {
    fn base(&self) -> &OperationBase {
        &self.base
    }

    fn immutable_workspace_size(&self) -> usize {
        self.workspace.size()
    }

    fn set_immutable_workspace(&mut self, workspace: DeviceSliceMut, stream: &Stream) -> Result<()> {
        self.workspace.upload(workspace, stream)
    }

    fn execute(
        &self,
        stream: &Stream,
        memory: &MemoryManager,
        _scratch: Option<&DeviceSliceMut>,
    ) -> Result<()> {
        let [a, b] = inputs(memory, &self.base)?;
        let out = output(memory, &self.base)?;
        let meta = self.workspace.slice()?.clone();
        let func = self.func;
        let rank = self.rank;

        stream.enqueue(self.base.label("kernel"), move || {
            let meta = meta.read::<u32>()?;
            if meta.first().map(|&r| r as usize) != Some(rank) || meta.len() != 1 + 3 * rank {
                return Err(Error::Workspace(format!(
                    "broadcast metadata of {} entries does not describe rank {rank}",
                    meta.len()
                )));
            }
            let (shape, strides) = meta[1..].split_at(rank);
            let (a_strides, b_strides) = strides.split_at(rank);
            let elements: usize = shape.iter().map(|&d| d as usize).product();

            let a = a.read::<f32>()?;
            let b = b.read::<f32>()?;
            let pairs = (0..elements).map(|linear| {
                let mut rem = linear;
                let (mut ia, mut ib) = (0, 0);
                for d in (0..rank).rev() {
                    let dim = shape[d] as usize;
                    let coord = rem % dim;
                    rem /= dim;
                    ia += coord * a_strides[d] as usize;
                    ib += coord * b_strides[d] as usize;
                }
                (a[ia], b[ib])
            });
            out.write_bytes(&func.evaluate(pairs))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{NodeKind, TensorDesc};

    fn node(kind: NodeKind, a: &[usize], b: &[usize], out: TensorDesc) -> GraphNode {
        GraphNode::new(
            "n",
            kind,
            vec![TensorDesc::new(DataType::F32, a), TensorDesc::new(DataType::F32, b)],
            vec![out],
        )
    }

    fn ids() -> (Vec<TensorId>, Vec<TensorId>) {
        (vec![TensorId(0), TensorId(1)], vec![TensorId(2)])
    }

    #[test]
    fn test_contiguous_rejects_broadcast_shapes() {
        let (i, o) = ids();
        let n = node(NodeKind::Add, &[2, 3], &[3], TensorDesc::new(DataType::F32, &[2, 3]));
        let err = BinaryElementwiseOp::add().build_contiguous(&n, &i, &o).err().unwrap();
        assert!(matches!(err, Error::Candidate(_)));

        let op = BinaryElementwiseOp::add()
            .build_broadcast(&n, &i, &o)
            .unwrap();
        assert_eq!(op.base().implementation(), BROADCAST);
        // rank, shape and two stride vectors as u32
        assert_eq!(op.immutable_workspace_size(), 28);
    }

    #[test]
    fn test_comparison_requires_bool_output() {
        let (i, o) = ids();
        let n = node(NodeKind::Less, &[4], &[4], TensorDesc::new(DataType::F32, &[4]));
        assert!(BinaryElementwiseOp::less().build_contiguous(&n, &i, &o).is_err());

        let n = node(NodeKind::Less, &[4], &[4], TensorDesc::new(DataType::Bool, &[4]));
        assert!(BinaryElementwiseOp::less().build_contiguous(&n, &i, &o).is_ok());
    }

    #[test]
    fn test_non_f32_rejected() {
        let (i, o) = ids();
        let n = GraphNode::new(
            "n",
            NodeKind::Add,
            vec![TensorDesc::new(DataType::I64, &[2]); 2],
            vec![TensorDesc::new(DataType::I64, &[2])],
        );
        let err = BinaryElementwiseOp::add().build_contiguous(&n, &i, &o).err().unwrap();
        assert!(err.to_string().contains("unsupported data type i64"));
    }

    #[test]
    fn test_evaluate() {
        let add = BinaryElementwiseOp::add().func;
        let bytes = add.evaluate([(1.0, 2.0), (3.0, -1.0)].into_iter());
        assert_eq!(bytemuck::pod_collect_to_vec::<u8, f32>(&bytes), vec![3.0, 2.0]);

        let greater = BinaryElementwiseOp::greater().func;
        assert_eq!(greater.evaluate([(1.0, 2.0), (3.0, -1.0)].into_iter()), vec![0, 1]);
    }
}
