//! Helper functions shared by operation implementations.

use kiln_core::{
    DataType, DeviceSlice, DeviceSliceMut, Error, GraphNode, MemoryManager, OperationBase, Result,
};

/// Broadcast multiple shapes to a common output shape.
///
/// Implements NumPy-style broadcasting rules:
/// - Shapes are aligned from the rightmost dimension
/// - Dimensions match if they are equal or one of them is 1
/// - Missing dimensions in shorter shapes are treated as 1
///
/// # Example
///
/// ```text
/// [2, 3, 4] + [3, 4]    -> [2, 3, 4]
/// [2, 3, 4] + [2, 1, 4] -> [2, 3, 4]
/// [8, 1, 6, 1] + [7, 1, 5] -> [8, 7, 6, 5]
/// ```
pub fn broadcast_shapes(shapes: &[&[usize]]) -> Result<Vec<usize>> {
    let max_rank = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut result = vec![1; max_rank];

    for shape in shapes {
        let rank = shape.len();

        // Iterate from the rightmost dimension
        for i in 0..max_rank {
            let shape_dim = if i < rank { shape[rank - 1 - i] } else { 1 };
            let result_idx = max_rank - 1 - i;
            let dim = result[result_idx];

            if dim == 1 {
                result[result_idx] = shape_dim;
            } else if shape_dim != 1 && shape_dim != dim {
                return Err(Error::Candidate(format!(
                    "cannot broadcast shapes: dimension mismatch at position {result_idx} \
                     (expected {dim} or 1, got {shape_dim})"
                )));
            }
        }
    }

    Ok(result)
}

/// Row-major element strides of `shape` as seen from the broadcast shape `out`.
///
/// Broadcast dimensions (size 1 or missing) get stride 0.
pub fn broadcast_strides(shape: &[usize], out: &[usize]) -> Vec<usize> {
    let offset = out.len() - shape.len();
    let mut strides = vec![0; out.len()];
    let mut stride = 1;
    for (i, &dim) in shape.iter().enumerate().rev() {
        if dim != 1 {
            strides[offset + i] = stride;
        }
        stride *= dim;
    }
    strides
}

/// Fail the candidate unless every input is f32.
pub fn require_f32(node: &GraphNode) -> Result<()> {
    match node.inputs.iter().find(|d| d.dtype != DataType::F32) {
        Some(desc) => Err(Error::Candidate(format!(
            "unsupported data type {} (only f32 is implemented)",
            desc.dtype
        ))),
        None => Ok(()),
    }
}

/// Resolve exactly `N` inputs of `op`.
pub fn inputs<const N: usize>(memory: &MemoryManager, op: &OperationBase) -> Result<[DeviceSlice; N]> {
    let slices = memory.input_tensors(op)?;
    let count = slices.len();
    slices.try_into().map_err(|_| {
        Error::Device(format!(
            "'{}' resolved {count} inputs, expected {N}",
            op.node_name()
        ))
    })
}

/// Resolve the single output of `op`.
pub fn output(memory: &MemoryManager, op: &OperationBase) -> Result<DeviceSliceMut> {
    let outputs: [DeviceSliceMut; 1] = memory.output_tensors(op)?.try_into().map_err(|v: Vec<_>| {
        Error::Device(format!(
            "'{}' resolved {} outputs, expected 1",
            op.node_name(),
            v.len()
        ))
    })?;
    let [out] = outputs;
    Ok(out)
}

/// Resolve a possibly negative `axis` against `rank`.
pub fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if resolved < 0 || resolved >= rank as i64 {
        return Err(Error::MalformedGraph(format!(
            "axis {axis} is out of range for rank {rank}"
        )));
    }
    Ok(resolved as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(
            broadcast_shapes(&[&[2, 3, 4], &[2, 3, 4]]).unwrap(),
            vec![2, 3, 4]
        );
        assert_eq!(
            broadcast_shapes(&[&[2, 3, 4], &[3, 4]]).unwrap(),
            vec![2, 3, 4]
        );
        assert_eq!(
            broadcast_shapes(&[&[8, 1, 6, 1], &[7, 1, 5]]).unwrap(),
            vec![8, 7, 6, 5]
        );
    }

    #[test]
    fn test_broadcast_incompatible() {
        assert!(broadcast_shapes(&[&[2, 3], &[2, 4]]).is_err());
    }

    #[test]
    fn test_broadcast_strides() {
        assert_eq!(broadcast_strides(&[2, 3], &[2, 3]), vec![3, 1]);
        assert_eq!(broadcast_strides(&[3], &[2, 3]), vec![0, 1]);
        assert_eq!(broadcast_strides(&[2, 1], &[2, 3]), vec![1, 0]);
        assert_eq!(broadcast_strides(&[], &[2, 3]), vec![0, 0]);
    }

    #[test]
    fn test_normalize_axis() {
        assert_eq!(normalize_axis(-1, 4).unwrap(), 3);
        assert_eq!(normalize_axis(1, 4).unwrap(), 1);
        assert!(normalize_axis(4, 4).is_err());
        assert!(normalize_axis(-5, 4).is_err());
    }
}
