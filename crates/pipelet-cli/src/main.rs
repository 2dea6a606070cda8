//! pipelet CLI: check, explain and run graph files.

use clap::{Parser, Subcommand};
use pipelet_core::config::GraphConfig;
use pipelet_core::operation::Operation;
use pipelet_exec::Runtime;
use pipelet_planner::{explain, parse_yaml_graph, rules, GraphPlan};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pipelet")]
#[command(about = "Reactive dataflow graphs of pipelets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a graph, feed it operations and print what subscriptions receive
    Run {
        /// Path to the graph YAML file
        #[arg(short, long)]
        graph: PathBuf,

        /// JSON lines of `{"node": ..., "operation": ..., "values": ...}` to submit
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Identity attributes, comma separated (overrides config)
        #[arg(long)]
        key: Option<String>,

        /// Transaction timeout in ms (overrides config)
        #[arg(long)]
        tx_timeout_ms: Option<u64>,

        /// Fetch chunk size (overrides config)
        #[arg(long)]
        fetch_chunk_size: Option<usize>,

        /// Keep the runtime ticking this long before printing results
        #[arg(long)]
        run_ms: Option<u64>,
    },

    /// Validate a graph YAML file (syntax, wiring, known pipelets)
    Validate {
        #[arg(short, long)]
        graph: PathBuf,
    },

    /// Show nodes, edges and effective upstream queries
    Explain {
        #[arg(short, long)]
        graph: PathBuf,
    },
}

#[derive(Debug, Clone, Default)]
struct Overrides {
    key: Option<String>,
    tx_timeout_ms: Option<u64>,
    fetch_chunk_size: Option<usize>,
}

#[derive(Deserialize)]
struct InputLine {
    node: String,
    #[serde(flatten)]
    operation: Operation,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            graph,
            input,
            key,
            tx_timeout_ms,
            fetch_chunk_size,
            run_ms,
        } => {
            let overrides = Overrides {
                key,
                tx_timeout_ms,
                fetch_chunk_size,
            };
            if let Err(e) = run_graph(&graph, input.as_deref(), &overrides, run_ms) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Validate { graph } => {
            if let Err(e) = validate_graph(&graph) {
                eprintln!("Validation failed: {}", e);
                std::process::exit(1);
            }
            println!("✓ Graph is valid");
        }
        Commands::Explain { graph } => {
            if let Err(e) = explain_graph(&graph) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn load(path: &Path) -> Result<GraphPlan, Box<dyn std::error::Error>> {
    let yaml = fs::read_to_string(path)?;
    Ok(parse_yaml_graph(&yaml)?)
}

fn run_graph(
    path: &Path,
    input: Option<&Path>,
    overrides: &Overrides,
    run_ms: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let plan = load(path)?;
    let mut config = plan.graph_config(GraphConfig::from_env());
    apply_overrides(&mut config, overrides);

    let mut rt = Runtime::new(config);
    rt.build(&plan)?;

    if let Some(input) = input {
        let text = fs::read_to_string(input)?;
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let line: InputLine =
                serde_json::from_str(line).map_err(|e| format!("input line {}: {}", n + 1, e))?;
            rt.submit(&line.node, line.operation)?;
        }
    }

    if let Some(ms) = run_ms {
        let tokio_rt = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
        tokio_rt.block_on(async {
            let (stop, shutdown) = tokio::sync::oneshot::channel();
            let timer = async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let _ = stop.send(());
            };
            let (result, _) = tokio::join!(rt.run(shutdown), timer);
            result
        })?;
    }

    for (spec, sub) in plan.subscriptions.iter().zip(rt.plan_subscriptions().to_vec()) {
        for op in rt.take_received(sub) {
            println!("{}\t{}", spec.node, serde_json::to_string(&op)?);
        }
    }
    Ok(())
}

fn validate_graph(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let plan = load(path)?;
    let rt = Runtime::new(GraphConfig::default());
    rules::check_pipelets(&plan, rt.registry().names())?;
    Ok(())
}

fn explain_graph(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let plan = load(path)?;
    println!("Graph");
    println!("=====");
    print!("{}", explain(&plan));
    println!();

    let rt = Runtime::from_plan(&plan)?;
    println!("Effective queries");
    println!("=================");
    print!("{}", rt.explain());
    Ok(())
}

fn apply_overrides(cfg: &mut GraphConfig, overrides: &Overrides) {
    if let Some(key) = &overrides.key {
        let key: Vec<String> = key
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        if !key.is_empty() {
            cfg.key = key;
        }
    }
    if let Some(ms) = overrides.tx_timeout_ms {
        cfg.tx_timeout_ms = Some(ms);
    }
    if let Some(size) = overrides.fetch_chunk_size {
        cfg.fetch_chunk_size = size;
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_overrides, GraphConfig, InputLine, Overrides};
    use pipelet_planner::PlanConfig;

    #[test]
    fn flags_override_graph_config() {
        let mut config = GraphConfig::default();
        PlanConfig {
            key: Some(vec!["flow".into(), "id".into()]),
            fetch_chunk_size: Some(8),
            ..Default::default()
        }
        .apply(&mut config);
        assert_eq!(config.fetch_chunk_size, 8);

        apply_overrides(
            &mut config,
            &Overrides {
                key: Some("uid, ".into()),
                tx_timeout_ms: Some(250),
                ..Default::default()
            },
        );
        assert_eq!(config.key, vec!["uid".to_string()]);
        assert_eq!(config.tx_timeout_ms, Some(250));
        assert_eq!(config.fetch_chunk_size, 8);
    }

    #[test]
    fn input_lines_carry_node_and_operation() {
        let line: InputLine =
            serde_json::from_str(r#"{"node": "source", "operation": "add", "values": [{"id": 1}]}"#).unwrap();
        assert_eq!(line.node, "source");
        assert_eq!(line.operation.change.len(), 1);
    }
}
