//! Sample fused convolution block run end to end on the reference device.

use anyhow::{Context, Result};
use kiln_core::{
    ActivationMode, ConvolutionParams, DataType, DeviceCapabilities, FusedConvolutionParams,
    Graph, NodeKind,
};
use kiln_runtime::{Runtime, Tensor};

const INPUT_SHAPE: [usize; 4] = [1, 3, 8, 8];
const FILTERS: usize = 4;

pub struct DemoOptions {
    pub graph_api: bool,
    pub implicit_precomp_gemm: bool,
    pub activation: ActivationMode,
    pub residual: bool,
    pub passes: usize,
}

/// `y = act(conv3x3(x) + bias [+ skip])` followed by `pooled = y > 0`.
fn build_graph(options: &DemoOptions) -> Result<Graph> {
    let [n, c, h, w] = INPUT_SHAPE;
    let out_shape = [n, FILTERS, h, w];
    let mut graph = Graph::new("demo_block");

    let x = graph.add_input("x", DataType::F32, &INPUT_SHAPE);
    let weights: Vec<f32> = (0..FILTERS * c * 9)
        .map(|i| ((i % 7) as f32 - 3.0) * 0.05)
        .collect();
    let filter = graph.add_constant_f32("filter", &[FILTERS, c, 3, 3], &weights)?;
    let bias = graph.add_constant_f32("bias", &[FILTERS], &[0.1, -0.2, 0.0, 0.3])?;
    let zero = graph.add_constant_f32("zero", &[1], &[0.0])?;
    let y = graph.add_output("y", DataType::F32, &out_shape);
    let positive = graph.add_output("positive", DataType::Bool, &out_shape);

    let mut inputs = vec![x, filter, bias];
    if options.residual {
        inputs.push(graph.add_input("skip", DataType::F32, &out_shape));
    }

    let params = FusedConvolutionParams {
        conv: ConvolutionParams::default().with_padding(1),
        activation: options.activation,
    };
    graph.add_node("conv", NodeKind::FusedConvolution(params), &inputs, &[y])?;
    graph.add_node("positive", NodeKind::Greater, &[y, zero], &[positive])?;
    Ok(graph)
}

pub fn run(options: &DemoOptions) -> Result<()> {
    let capabilities = DeviceCapabilities {
        graph_api: options.graph_api,
        implicit_precomp_gemm: options.implicit_precomp_gemm,
        ..Default::default()
    };
    let runtime = Runtime::new(capabilities);
    let graph = build_graph(options).context("Failed to build demo graph")?;
    let compiled = runtime
        .load_graph(&graph)
        .context("Failed to compile demo graph")?;

    println!("Compiled '{}':", compiled.name());
    for (node, implementation) in compiled.implementations() {
        println!("  {node:<10} -> {implementation}");
    }
    println!(
        "  immutable: {} bytes, workspaces: {} bytes, scratch: {} bytes\n",
        compiled.immutable_block().size(),
        compiled.workspace_allocation().map_or(0, |w| w.size()),
        compiled.scratch_size()
    );

    let mut request = compiled
        .create_request()
        .context("Failed to create inference request")?;
    let len: usize = INPUT_SHAPE.iter().product();
    let out_len = len / INPUT_SHAPE[1] * FILTERS;

    for pass in 0..options.passes {
        let shift = pass as f32 * 0.5;
        let x: Vec<f32> = (0..len).map(|i| (i % 11) as f32 * 0.1 - shift).collect();
        let mut inputs = vec![("x", Tensor::from_vec(x, &INPUT_SHAPE))];
        if options.residual {
            let skip = vec![0.25f32; out_len];
            let shape = [INPUT_SHAPE[0], FILTERS, INPUT_SHAPE[2], INPUT_SHAPE[3]];
            inputs.push(("skip", Tensor::from_vec(skip, &shape)));
        }

        let outputs = request
            .run(&inputs)
            .with_context(|| format!("Inference pass {pass} failed"))?;
        let y = outputs["y"].to_vec::<f32>()?;
        let positive = outputs["positive"].to_bools()?;

        let mean = y.iter().sum::<f32>() / y.len() as f32;
        let max = y.iter().copied().fold(f32::MIN, f32::max);
        let count = positive.iter().filter(|&&p| p).count();
        println!(
            "Pass {pass}: mean {mean:.4}, max {max:.4}, {count}/{} positive",
            positive.len()
        );
    }

    let stats = request.stream_stats();
    println!(
        "\nStream: {} submitted, {} completed, {} uploads ({} bytes)",
        stats.submitted, stats.completed, stats.uploads, stats.bytes_uploaded
    );
    Ok(())
}
