use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use gbn_abstract::{EngineConfig, FlowConfig, FlowId, LinkConfig};
use gbn_simulator::{Simulation, SimulationReport, scenario_runner};

#[derive(Parser, Debug)]
#[command(author, version, about = "Go-Back-N engine simulator")]
struct Args {
    /// Load a scenario from disk.
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Write a JSON trace of the finished simulation.
    #[arg(long)]
    trace_out: Option<PathBuf>,

    /// Number of concurrent flows in the default demo.
    #[arg(long, default_value_t = 3)]
    flows: u64,

    /// Messages queued on each flow in the default demo.
    #[arg(long, default_value_t = 10)]
    messages: usize,

    #[arg(long, default_value_t = 4)]
    window_size: usize,

    #[arg(long, default_value_t = 5)]
    max_retry: u32,

    /// Retransmission timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Probability that a data packet is lost.
    #[arg(long, default_value_t = 0.1)]
    loss_rate: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Give up on the demo after this many milliseconds.
    #[arg(long, default_value_t = 60_000)]
    max_duration_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt::init();
    info!("gbn-sim starting…");

    let report = if let Some(path) = &args.scenario {
        scenario_runner::run_scenario(path).await?
    } else {
        run_default_sim(&args).await?
    };

    info!(
        packets = report.data_packets_sent,
        acks = report.acks_sent,
        duration_ms = report.duration_ms,
        "simulation finished"
    );

    if let Some(trace_path) = &args.trace_out {
        write_trace(trace_path, &report)?;
    }

    Ok(())
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            flow: FlowConfig {
                window_size: self.window_size,
                max_retry: self.max_retry,
                retransmit_timeout_ms: self.timeout_ms,
            },
            ..Default::default()
        }
    }

    fn link_config(&self) -> LinkConfig {
        LinkConfig {
            loss_rate: self.loss_rate,
            seed: self.seed,
            ..Default::default()
        }
    }
}

async fn run_default_sim(args: &Args) -> Result<SimulationReport> {
    let sim = Simulation::new(args.engine_config(), args.link_config())?;
    for flow in 1..=args.flows {
        let id = FlowId(flow);
        for n in 0..args.messages {
            sim.enqueue(id, format!("{id} message {n}"))?;
        }
        sim.finish(id);
    }

    info!(
        flows = args.flows,
        messages = args.messages,
        "Starting default headless simulation…"
    );
    let reason = sim
        .run(Duration::from_millis(args.max_duration_ms))
        .await?;
    info!(%reason, "Simulation complete.");
    Ok(sim.export_report())
}

fn write_trace(path: &Path, report: &SimulationReport) -> Result<()> {
    let data = serde_json::to_vec_pretty(report).context("Failed to serialize simulation trace")?;
    fs::write(path, &data)
        .with_context(|| format!("Failed to write trace file {}", path.display()))?;
    Ok(())
}
