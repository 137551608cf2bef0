//! Concat: insert each input into its range of the output.
//!
//! Copies are byte-wise, so every element type is supported. The per-input
//! insert descriptors are kept in an immutable workspace.

use kiln_core::{
    Device, DeviceSliceMut, Error, GraphNode, ImmutableWorkspace, MemoryManager, NodeKind, Operation,
    OperationBase, Result, Stream, TensorId,
};

use crate::helpers::{normalize_axis, output};

pub const CONCAT: &str = "ConcatInsert";

/// Words per input descriptor: `[outer, in_axis, out_axis, inner_bytes, start]`.
const INSERT_WORDS: usize = 5;

pub struct ConcatOp {
    base: OperationBase,
    props: ImmutableWorkspace,
}

pub fn build(
    _device: &Device,
    node: &GraphNode,
    input_ids: &[TensorId],
    output_ids: &[TensorId],
) -> Result<Box<dyn Operation>> {
    let NodeKind::Concat { axis } = node.kind else {
        return Err(Error::Candidate(format!("{} is not a concat", node.op_type())));
    };
    let out = node.output(0)?;
    let rank = out.rank();
    let axis = normalize_axis(axis, rank)?;

    let outer: usize = out.shape[..axis].iter().product();
    let inner_bytes = out.shape[axis + 1..].iter().product::<usize>() * out.dtype.size();
    let out_axis = out.shape[axis];

    let mut words = Vec::with_capacity(node.input_count() * INSERT_WORDS);
    let mut start = 0;
    for (i, desc) in node.inputs.iter().enumerate() {
        let mismatch = desc.rank() != rank
            || desc
                .shape
                .iter()
                .zip(&out.shape)
                .enumerate()
                .any(|(d, (a, b))| d != axis && a != b);
        if mismatch {
            return Err(Error::MalformedGraph(format!(
                "concat input {i} of '{}' has shape {:?}, incompatible with output {:?} on axis {axis}",
                node.name, desc.shape, out.shape
            )));
        }
        words.extend([outer, desc.shape[axis], out_axis, inner_bytes, start].map(|v| v as u32));
        start += desc.shape[axis];
    }
    if start != out_axis {
        return Err(Error::MalformedGraph(format!(
            "concat inputs of '{}' cover {start} of {out_axis} entries on axis {axis}",
            node.name
        )));
    }

    Ok(Box::new(ConcatOp {
        base: OperationBase::new(node, CONCAT, input_ids, output_ids),
        props: ImmutableWorkspace::from_u32(&words),
    }))
}

impl Operation for ConcatOp {
    fn base(&self) -> &OperationBase {
        &self.base
    }

    fn immutable_workspace_size(&self) -> usize {
        self.props.size()
    }

    fn set_immutable_workspace(&mut self, workspace: DeviceSliceMut, stream: &Stream) -> Result<()> {
        self.props.upload(workspace, stream)
    }

    fn execute(
        &self,
        stream: &Stream,
        memory: &MemoryManager,
        _scratch: Option<&DeviceSliceMut>,
    ) -> Result<()> {
        let sources = memory.input_tensors(&self.base)?;
        let out = output(memory, &self.base)?;
        let props = self.props.slice()?;
        let stride = INSERT_WORDS * std::mem::size_of::<u32>();

        for (i, src) in sources.into_iter().enumerate() {
            let desc = props.sub_slice(i * stride, stride)?;
            let dst = out.clone();
            stream.enqueue(self.base.label(&format!("insert{i}")), move || {
                let p = desc.read::<u32>()?;
                let [outer, in_axis, out_axis, inner, start] =
                    [p[0], p[1], p[2], p[3], p[4]].map(|v| v as usize);
                let bytes = src.read_bytes()?;
                let run = in_axis * inner;
                for o in 0..outer {
                    let offset = (o * out_axis + start) * inner;
                    dst.sub_slice(offset, run)?
                        .write_bytes(&bytes[o * run..(o + 1) * run])?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }
}
