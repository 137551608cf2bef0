//! Reference convolution kernels.
//!
//! All tensors are dense row-major f32: input `[N, C, H, W]`, filter
//! `[K, C / groups, R, S]`, output `[N, K, OH, OW]`.

use kiln_core::{ActivationMode, DeviceSliceMut, Error, Result};

use super::descriptors::{ConvolutionAlgorithm, ConvolutionGeometry};

/// Run the convolution with `algorithm`. `Gemm` stages its columns in `scratch`.
pub fn convolve(
    g: &ConvolutionGeometry,
    algorithm: ConvolutionAlgorithm,
    input: &[f32],
    filter: &[f32],
    scratch: Option<&DeviceSliceMut>,
) -> Result<Vec<f32>> {
    match algorithm {
        ConvolutionAlgorithm::Gemm => {
            let scratch = scratch.ok_or_else(|| {
                Error::Workspace("gemm convolution needs a scratch buffer".to_string())
            })?;
            convolve_gemm(g, input, filter, scratch)
        }
        ConvolutionAlgorithm::ImplicitGemm | ConvolutionAlgorithm::ImplicitPrecompGemm => {
            Ok(convolve_direct(g, input, filter))
        }
    }
}

/// Input pixel read by output pixel `o` through filter tap `k`, if inside the image.
#[inline]
fn source_index(g: &ConvolutionGeometry, axis: usize, o: usize, k: usize) -> Option<usize> {
    let pos = (o * g.strides[axis] + k * g.dilations[axis]).checked_sub(g.pads_begin[axis])?;
    (pos < g.in_size[axis]).then_some(pos)
}

pub fn convolve_direct(g: &ConvolutionGeometry, input: &[f32], filter: &[f32]) -> Vec<f32> {
    let [in_h, in_w] = g.in_size;
    let [out_h, out_w] = g.out_size;
    let [kernel_h, kernel_w] = g.kernel;
    let cpg = g.channels_per_group();
    let kpg = g.filters_per_group();
    let mut out = vec![0.0f32; g.output_elements()];

    for n in 0..g.batch {
        for k in 0..g.out_channels {
            let group = k / kpg;
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = 0.0f32;
                    for c in 0..cpg {
                        let channel = group * cpg + c;
                        for r in 0..kernel_h {
                            let Some(iy) = source_index(g, 0, oy, r) else {
                                continue;
                            };
                            for s in 0..kernel_w {
                                let Some(ix) = source_index(g, 1, ox, s) else {
                                    continue;
                                };
                                let x = input[((n * g.in_channels + channel) * in_h + iy) * in_w + ix];
                                let w = filter[((k * cpg + c) * kernel_h + r) * kernel_w + s];
                                acc += x * w;
                            }
                        }
                    }
                    out[((n * g.out_channels + k) * out_h + oy) * out_w + ox] = acc;
                }
            }
        }
    }
    out
}

/// Lower one image group to a `[patch_len, out_pixels]` column matrix.
fn im2col(g: &ConvolutionGeometry, input: &[f32], n: usize, group: usize) -> Vec<f32> {
    let [in_h, in_w] = g.in_size;
    let [out_h, out_w] = g.out_size;
    let [kernel_h, kernel_w] = g.kernel;
    let pixels = g.out_pixels();
    let mut col = vec![0.0f32; g.patch_len() * pixels];

    for c in 0..g.channels_per_group() {
        let channel = group * g.channels_per_group() + c;
        for r in 0..kernel_h {
            for s in 0..kernel_w {
                let row = (c * kernel_h + r) * kernel_w + s;
                for oy in 0..out_h {
                    let Some(iy) = source_index(g, 0, oy, r) else {
                        continue;
                    };
                    for ox in 0..out_w {
                        if let Some(ix) = source_index(g, 1, ox, s) {
                            col[row * pixels + oy * out_w + ox] =
                                input[((n * g.in_channels + channel) * in_h + iy) * in_w + ix];
                        }
                    }
                }
            }
        }
    }
    col
}

fn convolve_gemm(
    g: &ConvolutionGeometry,
    input: &[f32],
    filter: &[f32],
    scratch: &DeviceSliceMut,
) -> Result<Vec<f32>> {
    let patch = g.patch_len();
    let pixels = g.out_pixels();
    let cols = scratch.sub_slice(0, patch * pixels * std::mem::size_of::<f32>())?;
    let mut out = vec![0.0f32; g.output_elements()];

    for n in 0..g.batch {
        for group in 0..g.groups {
            cols.write(&im2col(g, input, n, group))?;
            let col = cols.read::<f32>()?;

            for kg in 0..g.filters_per_group() {
                let k = group * g.filters_per_group() + kg;
                let weights = &filter[k * patch..(k + 1) * patch];
                let dst = &mut out[(n * g.out_channels + k) * pixels..][..pixels];
                for (j, &w) in weights.iter().enumerate() {
                    let row = &col[j * pixels..(j + 1) * pixels];
                    for (d, &x) in dst.iter_mut().zip(row) {
                        *d += w * x;
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Add one bias value per output channel.
pub fn add_bias(g: &ConvolutionGeometry, out: &mut [f32], bias: &[f32]) {
    let pixels = g.out_pixels();
    for (i, plane) in out.chunks_mut(pixels.max(1)).enumerate() {
        let b = bias[i % g.out_channels];
        plane.iter_mut().for_each(|v| *v += b);
    }
}

pub fn add_residual(out: &mut [f32], other: &[f32]) {
    out.iter_mut().zip(other).for_each(|(v, o)| *v += o);
}

pub fn activate(out: &mut [f32], activation: ActivationMode) {
    if activation != ActivationMode::None {
        out.iter_mut().for_each(|v| *v = activation.apply(*v));
    }
}
