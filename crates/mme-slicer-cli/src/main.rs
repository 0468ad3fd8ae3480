//! Command-line driver: slices a JSON graph description for a device and prints the program.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::info;
use mme_slicer::graph::description::GraphDescription;
use mme_slicer::{DeviceCaps, SlicerConfig, SramSlicingPass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Full program as pretty-printed JSON.
    Json,
    /// One line per bundle plus statistics.
    Summary,
}

#[derive(Parser)]
#[command(name = "mme-slicer", version, about = "Slice MME operators to fit on-chip SRAM")]
struct Cli {
    /// Graph description (JSON).
    graph: PathBuf,

    /// Pass configuration (JSON); `SRAM_SLICER_*` variables are applied on top.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Device preset name.
    #[arg(long, default_value = "gaudi", conflicts_with = "device_file")]
    device: String,

    /// Device capabilities (JSON) instead of a preset.
    #[arg(long, value_name = "PATH")]
    device_file: Option<PathBuf>,

    /// Overrides the SRAM budget in bytes; 0 disables slicing.
    #[arg(long)]
    capacity: Option<u64>,

    #[arg(long, value_enum, default_value = "summary")]
    format: OutputFormat,

    /// Writes the output to a file instead of stdout.
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
}

fn load_device(cli: &Cli) -> Result<DeviceCaps> {
    if let Some(path) = &cli.device_file {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read device file {}", path.display()))?;
        return serde_json::from_str(&text)
            .with_context(|| format!("failed to parse device file {}", path.display()));
    }
    DeviceCaps::preset(&cli.device)
        .with_context(|| format!("unknown device preset `{}`", cli.device))
}

fn load_config(cli: &Cli) -> Result<SlicerConfig> {
    let mut config = match &cli.config {
        Some(path) => SlicerConfig::from_json_file(path)?,
        None => SlicerConfig::default(),
    };
    config
        .apply_env()
        .context("invalid SRAM_SLICER_* environment")?;
    if let Some(bytes) = cli.capacity {
        config.sram_capacity_override = Some(bytes);
    }
    Ok(config)
}

/// Runs the pass described by `cli` and renders the program in the requested format.
fn run(cli: &Cli) -> Result<String> {
    let device = load_device(cli)?;
    let config = load_config(cli)?;
    let graph = GraphDescription::from_json_file(&cli.graph)?
        .build()
        .with_context(|| format!("invalid graph {}", cli.graph.display()))?;
    info!(
        "loaded {} nodes, {} tensors for {}",
        graph.nodes().len(),
        graph.tensors().len(),
        device.name
    );

    let program = SramSlicingPass::new(&device, config)
        .run(&graph)
        .context("slicing pass failed")?;
    match cli.format {
        OutputFormat::Json => program.to_json().context("failed to serialize program"),
        OutputFormat::Summary => Ok(program.summary()),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let text = run(&cli)?;
    match &cli.output {
        Some(path) => fs::write(path, text + "\n")
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{text}"),
    }
    Ok(())
}
