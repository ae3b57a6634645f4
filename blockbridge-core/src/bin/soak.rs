use std::path::PathBuf;

use anyhow::Context;
use blockbridge_core::soak::{load_config, run_soak, save_config, SoakConfig};

#[derive(Debug)]
struct Args {
    config: Option<PathBuf>,
    blocks: Option<usize>,
    output: Option<PathBuf>,
    save_config: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("soak failed: {e:#}");
        std::process::exit(1);
    }
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: None,
        blocks: None,
        output: None,
        save_config: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let Some(v) = it.next() else {
                    anyhow::bail!("missing value for --config");
                };
                args.config = Some(PathBuf::from(v));
            }
            "--blocks" => {
                let Some(v) = it.next() else {
                    anyhow::bail!("missing value for --blocks");
                };
                let blocks = v
                    .parse::<usize>()
                    .with_context(|| format!("invalid value for --blocks: {v}"))?;
                args.blocks = Some(blocks);
            }
            "--output" => {
                let Some(v) = it.next() else {
                    anyhow::bail!("missing value for --output");
                };
                args.output = Some(PathBuf::from(v));
            }
            "--save-config" => {
                let Some(v) = it.next() else {
                    anyhow::bail!("missing value for --save-config");
                };
                args.save_config = Some(PathBuf::from(v));
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p blockbridge-core --bin blockbridge-soak -- \\
  [--config <file.json>] [--blocks <n>] [--output <file.json>] [--save-config <file.json>]"
                );
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;
    let mut config = args
        .config
        .as_deref()
        .map(load_config)
        .unwrap_or_else(SoakConfig::default);
    if let Some(blocks) = args.blocks {
        config.blocks = blocks;
    }
    if let Some(path) = &args.save_config {
        save_config(path, &config)
            .with_context(|| format!("writing config to {}", path.display()))?;
        println!("Wrote soak config: {}", path.display());
    }

    let report = run_soak(&config).context("soak run")?;
    println!(
        "Done. blocks={} latency={:?} (expected {}) writer_xruns={} reader_xruns={} configs={}/{}",
        report.blocks_processed,
        report.measured_latency_frames,
        report.expected_latency_frames,
        report.drift.writer_xruns_total,
        report.drift.reader_xruns_total,
        report.configs_observed,
        report.configs_published,
    );

    let json = serde_json::to_string_pretty(&report)?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&out, json)?;
        println!("Wrote soak report: {}", out.display());
    } else {
        println!("{json}");
    }
    Ok(())
}
