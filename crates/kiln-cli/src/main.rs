//! Kiln CLI - list candidate implementations and exercise the backend on a sample graph.

mod demo;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use kiln_core::ActivationMode;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Operation dispatch and device memory backend for optimized graphs", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered node types and their candidates in trial order
    Candidates {
        /// Only show this node type
        #[arg(value_name = "OP_TYPE")]
        op_type: Option<String>,
    },
    /// Compile and run a fused convolution block on the reference device
    Demo {
        /// Enable the graph-based fused convolution path
        #[arg(long)]
        graph_api: bool,

        /// Disable the implicit precomputed GEMM algorithm
        #[arg(long)]
        no_precomp_gemm: bool,

        /// Activation fused into the convolution
        #[arg(short, long, value_enum, default_value = "relu")]
        activation: Activation,

        /// Add a residual input to the convolution
        #[arg(long)]
        residual: bool,

        /// Number of inference passes to run
        #[arg(short, long, default_value = "2")]
        passes: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Activation {
    None,
    Relu,
    Sigmoid,
    Tanh,
}

impl From<Activation> for ActivationMode {
    fn from(activation: Activation) -> Self {
        match activation {
            Activation::None => ActivationMode::None,
            Activation::Relu => ActivationMode::Relu,
            Activation::Sigmoid => ActivationMode::Sigmoid,
            Activation::Tanh => ActivationMode::Tanh,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Candidates { op_type } => {
            cmd_candidates(op_type.as_deref())?;
        }
        Commands::Demo {
            graph_api,
            no_precomp_gemm,
            activation,
            residual,
            passes,
        } => {
            let options = demo::DemoOptions {
                graph_api,
                implicit_precomp_gemm: !no_precomp_gemm,
                activation: activation.into(),
                residual,
                passes,
            };
            demo::run(&options)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

/// Print each node type with its candidates, highest priority first.
fn cmd_candidates(filter: Option<&str>) -> Result<()> {
    let registry = kiln_operators::core_operation_registry();

    let op_types: Vec<&str> = match filter {
        Some(op_type) if registry.contains(op_type) => vec![op_type],
        Some(op_type) => anyhow::bail!("No candidates registered for '{op_type}'"),
        None => registry.op_types(),
    };

    for op_type in op_types {
        println!("{op_type}");
        if let Some(pre) = registry.preconditions(op_type) {
            println!("  inputs: {}, outputs: {}", pre.inputs, pre.outputs);
        }
        for (rank, candidate) in registry.candidates(op_type).iter().enumerate() {
            println!("  {}. {candidate}", rank + 1);
        }
    }

    Ok(())
}
