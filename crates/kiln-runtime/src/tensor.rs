//! Host tensors exchanged with a compiled graph.

use crate::error::{Result, RuntimeError};
use bytemuck::Pod;
use kiln_core::{DataType, TensorDesc};

/// Host-side element types with a fixed device data type.
pub trait Element: Pod {
    const DTYPE: DataType;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
}

impl Element for i32 {
    const DTYPE: DataType = DataType::I32;
}

impl Element for i64 {
    const DTYPE: DataType = DataType::I64;
}

impl Element for u8 {
    const DTYPE: DataType = DataType::U8;
}

/// User-facing tensor for input and output data.
///
/// Holds host bytes plus the element type and shape they describe.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<u8>,
    shape: Vec<usize>,
    dtype: DataType,
}

impl Tensor {
    /// Create a tensor from a vector with a given shape.
    ///
    /// # Example
    /// ```
    /// # use kiln_runtime::Tensor;
    /// let tensor = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2]);
    /// assert_eq!(tensor.len(), 4);
    /// ```
    ///
    /// # Panics
    /// Panics if the data length does not match the shape.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Self {
        let expected_len: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_len,
            "Data length {} doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_len
        );

        Self {
            data: bytemuck::cast_slice(&data).to_vec(),
            shape: shape.to_vec(),
            dtype: T::DTYPE,
        }
    }

    /// Create a tensor from raw bytes of any data type (including `Bool` and `F16`).
    ///
    /// # Errors
    /// Returns an error if the byte length does not match the shape and type.
    pub fn from_raw(data: Vec<u8>, shape: &[usize], dtype: DataType) -> Result<Self> {
        let expected = TensorDesc::new(dtype, shape).size_bytes();
        if data.len() != expected {
            return Err(RuntimeError::TensorError(format!(
                "{} bytes given for {dtype}{shape:?}, expected {expected}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            shape: shape.to_vec(),
            dtype,
        })
    }

    /// Get a slice view of the tensor data.
    ///
    /// # Errors
    /// Returns an error if `T` is not the tensor's element type.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        if T::DTYPE != self.dtype {
            return Err(RuntimeError::TensorError(format!(
                "tensor holds {} elements, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }
        bytemuck::try_cast_slice(&self.data)
            .map_err(|e| RuntimeError::TensorError(format!("cannot view tensor data: {e}")))
    }

    /// Convert tensor to a Vec.
    ///
    /// # Errors
    /// Returns an error if `T` is not the tensor's element type.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(RuntimeError::TensorError(format!(
                "tensor holds {} elements, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(&self.data))
    }

    /// Interpret a `Bool` tensor as booleans.
    pub fn to_bools(&self) -> Result<Vec<bool>> {
        if self.dtype != DataType::Bool {
            return Err(RuntimeError::TensorError(format!(
                "tensor holds {} elements, requested bool",
                self.dtype
            )));
        }
        Ok(self.data.iter().map(|&b| b != 0).collect())
    }

    /// Get raw bytes of the tensor data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Get the total number of elements in the tensor.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptor of this tensor's element type and shape.
    pub fn desc(&self) -> TensorDesc {
        TensorDesc::new(self.dtype, &self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_from_vec() {
        let tensor = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2]);

        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(tensor.dtype(), DataType::F32);
        assert_eq!(tensor.len(), 4);
        assert_eq!(tensor.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    #[should_panic(expected = "doesn't match shape")]
    fn test_tensor_shape_mismatch() {
        let _ = Tensor::from_vec(vec![1.0f32, 2.0, 3.0], &[2, 2]);
    }

    #[test]
    fn test_wrong_element_type() {
        let tensor = Tensor::from_vec(vec![1i32, 2], &[2]);
        assert!(tensor.to_vec::<f32>().is_err());
        assert!(tensor.as_slice::<i64>().is_err());
        assert_eq!(tensor.to_vec::<i32>().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_from_raw_bool() {
        let tensor = Tensor::from_raw(vec![1, 0, 1], &[3], DataType::Bool).unwrap();
        assert_eq!(tensor.to_bools().unwrap(), vec![true, false, true]);
        assert!(Tensor::from_raw(vec![0; 5], &[2], DataType::F16).is_err());
    }
}
