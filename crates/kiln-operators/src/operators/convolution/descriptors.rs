//! Convolution geometry and algorithm selection.

use kiln_core::{ConvolutionParams, DeviceCapabilities, Error, Result, TensorDesc};
use std::fmt;

/// Forward convolution algorithm chosen for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvolutionAlgorithm {
    /// Explicit im2col into scratch followed by a matrix multiply.
    Gemm,
    ImplicitGemm,
    ImplicitPrecompGemm,
}

impl ConvolutionAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            ConvolutionAlgorithm::Gemm => "gemm",
            ConvolutionAlgorithm::ImplicitGemm => "implicit_gemm",
            ConvolutionAlgorithm::ImplicitPrecompGemm => "implicit_precomp_gemm",
        }
    }
}

impl fmt::Display for ConvolutionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validated shape information of a 2D NCHW convolution.
///
/// The filter layout is `[K, C / groups, R, S]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvolutionGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub in_size: [usize; 2],
    pub out_channels: usize,
    pub kernel: [usize; 2],
    pub out_size: [usize; 2],
    pub groups: usize,
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    pub pads_begin: [usize; 2],
    pub pads_end: [usize; 2],
}

/// Number of `u32` words produced by `ConvolutionGeometry::to_words`.
pub const GEOMETRY_WORDS: usize = 19;

impl ConvolutionGeometry {
    pub fn new(
        input: &TensorDesc,
        filter: &TensorDesc,
        output: &TensorDesc,
        params: &ConvolutionParams,
        groups: usize,
    ) -> Result<Self> {
        let malformed = |msg: String| Err(Error::MalformedGraph(msg));

        let [batch, in_channels, in_h, in_w] = rank4("input", input)?;
        let [out_channels, filter_channels, kernel_h, kernel_w] = rank4("filter", filter)?;
        rank4("output", output)?;

        if groups == 0 || in_channels % groups != 0 || out_channels % groups != 0 {
            return malformed(format!(
                "{groups} groups do not divide {in_channels} input and {out_channels} output channels"
            ));
        }
        if filter_channels != in_channels / groups {
            return malformed(format!(
                "filter has {filter_channels} channels per group, expected {}",
                in_channels / groups
            ));
        }
        if params.strides.contains(&0) || params.dilations.contains(&0) {
            return malformed("strides and dilations must be positive".to_string());
        }

        let out_size = [
            output_dim(in_h, kernel_h, params, 0)?,
            output_dim(in_w, kernel_w, params, 1)?,
        ];
        let expected = [batch, out_channels, out_size[0], out_size[1]];
        if output.shape != expected {
            return malformed(format!(
                "output shape {:?} does not match the convolution result {expected:?}",
                output.shape
            ));
        }

        Ok(Self {
            batch,
            in_channels,
            in_size: [in_h, in_w],
            out_channels,
            kernel: [kernel_h, kernel_w],
            out_size,
            groups,
            strides: params.strides,
            dilations: params.dilations,
            pads_begin: params.pads_begin,
            pads_end: params.pads_end,
        })
    }

    pub fn channels_per_group(&self) -> usize {
        self.in_channels / self.groups
    }

    pub fn filters_per_group(&self) -> usize {
        self.out_channels / self.groups
    }

    /// Rows of one group's im2col matrix: `C / groups * R * S`.
    pub fn patch_len(&self) -> usize {
        self.channels_per_group() * self.kernel[0] * self.kernel[1]
    }

    pub fn out_pixels(&self) -> usize {
        self.out_size[0] * self.out_size[1]
    }

    pub fn output_elements(&self) -> usize {
        self.batch * self.out_channels * self.out_pixels()
    }

    /// 1x1 filter with unit stride and no padding.
    pub fn is_pointwise(&self) -> bool {
        self.kernel == [1, 1]
            && self.strides == [1, 1]
            && self.pads_begin == [0, 0]
            && self.pads_end == [0, 0]
    }

    /// Pick the forward algorithm the device would use for this geometry.
    pub fn select_algorithm(&self, caps: &DeviceCapabilities) -> ConvolutionAlgorithm {
        if self.is_pointwise() {
            ConvolutionAlgorithm::Gemm
        } else if caps.implicit_precomp_gemm {
            ConvolutionAlgorithm::ImplicitPrecompGemm
        } else {
            ConvolutionAlgorithm::ImplicitGemm
        }
    }

    /// Scratch bytes needed by `algorithm`.
    pub fn workspace_size(&self, algorithm: ConvolutionAlgorithm) -> usize {
        match algorithm {
            ConvolutionAlgorithm::Gemm => {
                self.patch_len() * self.out_pixels() * std::mem::size_of::<f32>()
            }
            ConvolutionAlgorithm::ImplicitGemm | ConvolutionAlgorithm::ImplicitPrecompGemm => 0,
        }
    }

    /// Flatten into `GEOMETRY_WORDS` words for device-side descriptors.
    pub fn to_words(&self) -> Vec<u32> {
        [
            self.batch,
            self.in_channels,
            self.in_size[0],
            self.in_size[1],
            self.out_channels,
            self.kernel[0],
            self.kernel[1],
            self.out_size[0],
            self.out_size[1],
            self.groups,
            self.strides[0],
            self.strides[1],
            self.dilations[0],
            self.dilations[1],
            self.pads_begin[0],
            self.pads_begin[1],
            self.pads_end[0],
            self.pads_end[1],
            // Trailing marker distinguishes a real descriptor from zeroed memory
            GEOMETRY_WORDS,
        ]
        .iter()
        .map(|&v| v as u32)
        .collect()
    }

    pub fn from_words(words: &[u32]) -> Result<Self> {
        if words.len() != GEOMETRY_WORDS || words[GEOMETRY_WORDS - 1] as usize != GEOMETRY_WORDS {
            return Err(Error::Workspace(format!(
                "convolution descriptor of {} words is corrupt",
                words.len()
            )));
        }
        let w = |i: usize| words[i] as usize;
        Ok(Self {
            batch: w(0),
            in_channels: w(1),
            in_size: [w(2), w(3)],
            out_channels: w(4),
            kernel: [w(5), w(6)],
            out_size: [w(7), w(8)],
            groups: w(9),
            strides: [w(10), w(11)],
            dilations: [w(12), w(13)],
            pads_begin: [w(14), w(15)],
            pads_end: [w(16), w(17)],
        })
    }
}

fn rank4(what: &str, desc: &TensorDesc) -> Result<[usize; 4]> {
    desc.shape.as_slice().try_into().map_err(|_| {
        Error::MalformedGraph(format!(
            "convolution {what} must be rank 4 (NCHW), got {:?}",
            desc.shape
        ))
    })
}

fn output_dim(input: usize, kernel: usize, params: &ConvolutionParams, axis: usize) -> Result<usize> {
    let padded = input + params.pads_begin[axis] + params.pads_end[axis];
    let extent = params.dilations[axis] * (kernel.max(1) - 1) + 1;
    if kernel == 0 || padded < extent {
        return Err(Error::MalformedGraph(format!(
            "filter extent {extent} exceeds padded input {padded} on axis {axis}"
        )));
    }
    Ok((padded - extent) / params.strides[axis] + 1)
}
