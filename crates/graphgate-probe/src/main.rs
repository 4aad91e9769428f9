//! CLI entry point for graphgate-probe: run reads, writes, and health checks
//! through the graph access layer and print the results as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

use graphgate_core::{AccessConfig, EntityId, Mutation, SearchRequest, TierKind, TraversalRequest};
use graphgate_graph::{cypher, GraphAccess, MemoryGraph, Neo4jConnector, QuerySpec, SessionFactory};

#[derive(Parser)]
#[command(name = "graphgate-probe")]
#[command(about = "Exercise the graph access layer from the command line")]
struct Cli {
    /// Config file prefix (default: graphgate).
    #[arg(short, long, default_value = "graphgate")]
    config: String,

    /// Backend to talk to.
    #[arg(short, long, value_enum, default_value_t = Backend::Neo4j)]
    backend: Backend,

    /// JSON array of mutations to load into the memory backend first.
    #[arg(long)]
    seed: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    Neo4j,
    Memory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Tier {
    Node,
    Search,
    Relationship,
    Traversal,
}

impl From<Tier> for TierKind {
    fn from(t: Tier) -> Self {
        match t {
            Tier::Node => TierKind::Node,
            Tier::Search => TierKind::Search,
            Tier::Relationship => TierKind::Relationship,
            Tier::Traversal => TierKind::Traversal,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Ping the backend and report pool health.
    Health,
    /// Run a raw read query.
    Query {
        #[arg(short, long)]
        text: String,
        /// Query parameter as key=value; values parse as JSON when they can.
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
        /// Cache the result in this tier.
        #[arg(long, value_enum)]
        tier: Option<Tier>,
        /// Run the query this many times (later runs may hit the cache).
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Fetch one entity by id.
    Get { id: String },
    /// Full-text search over entity properties.
    Search {
        text: String,
        #[arg(long)]
        entity_type: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, default_value_t = 25)]
        limit: u32,
    },
    /// Entities reachable from a start entity.
    Traverse {
        start: String,
        #[arg(short, long, default_value_t = 2)]
        depth: u32,
        #[arg(long = "via")]
        rel_types: Vec<String>,
    },
    /// Apply a JSON array of mutations as one batch.
    Apply { file: PathBuf },
    /// Print cache, pool, and operation statistics.
    Stats,
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in {raw:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn read_mutations(path: &PathBuf) -> anyhow::Result<Vec<Mutation>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn factory(cli: &Cli, config: &AccessConfig) -> anyhow::Result<Arc<dyn SessionFactory>> {
    match cli.backend {
        Backend::Neo4j => {
            if cli.seed.is_some() {
                anyhow::bail!("--seed only applies to --backend memory");
            }
            Ok(Arc::new(Neo4jConnector::new(config)))
        }
        Backend::Memory => {
            let graph = MemoryGraph::new();
            if let Some(path) = &cli.seed {
                let mutations = read_mutations(path)?;
                for m in &mutations {
                    graph.seed(m).map_err(|e| anyhow::anyhow!("seeding {}: {e}", m.kind()))?;
                }
                tracing::info!(count = mutations.len(), "Memory backend seeded");
            }
            Ok(Arc::new(graph))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(access: &GraphAccess, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Health => {
            access.execute(&QuerySpec::new(cypher::PING)).await?;
            print_json(&access.health())?;
        }
        Command::Query {
            text,
            params,
            tier,
            repeat,
        } => {
            let mut spec = QuerySpec::new(text);
            for (key, value) in params {
                spec = spec.param(key, value);
            }
            if let Some(tier) = tier {
                spec = spec.cached_in(tier.into());
            }
            for run in 1..=repeat.max(1) {
                let result = access.execute(&spec).await?;
                tracing::info!(run, rows = result.len(), from_cache = result.from_cache, "Query finished");
                if run == repeat.max(1) {
                    print_json(&*result.rows)?;
                }
            }
        }
        Command::Get { id } => {
            let entity = access.get_entity(&EntityId::new(id)).await?;
            print_json(&entity)?;
        }
        Command::Search {
            text,
            entity_type,
            offset,
            limit,
        } => {
            let mut request = SearchRequest::new(text).page(offset, limit);
            if let Some(t) = entity_type {
                request = request.of_type(t);
            }
            print_json(&access.search(&request).await?)?;
        }
        Command::Traverse {
            start,
            depth,
            rel_types,
        } => {
            let request = rel_types
                .into_iter()
                .fold(TraversalRequest::new(start, depth), TraversalRequest::via);
            print_json(&access.traverse(&request).await?)?;
        }
        Command::Apply { file } => {
            let mutations = read_mutations(&file)?;
            print_json(&access.execute_batch(&mutations).await?)?;
        }
        Command::Stats => {
            print_json(&serde_json::json!({
                "cache": access.cache_stats(),
                "pool": access.pool_stats(),
                "health": access.health(),
                "metrics": access.metrics_summary(),
            }))?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = AccessConfig::load(&cli.config)?;
    let factory = factory(&cli, &config)?;
    let access = GraphAccess::start(config, factory).await?;

    let outcome = run(&access, cli.command).await;
    let summary = access.shutdown().await;
    tracing::info!(
        calls = summary.total_calls,
        failures = summary.total_failures,
        alerts = summary.alerts_emitted,
        "Probe finished"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_parse_json_values_and_fall_back_to_strings() {
        assert_eq!(parse_param("limit=10").unwrap(), ("limit".into(), Value::from(10)));
        assert_eq!(parse_param("id=doc-1").unwrap(), ("id".into(), Value::from("doc-1")));
        assert_eq!(parse_param("q=a=b").unwrap(), ("q".into(), Value::from("a=b")));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[test]
    fn query_subcommand_collects_params_and_tier() {
        let cli = Cli::try_parse_from([
            "graphgate-probe",
            "--backend",
            "memory",
            "query",
            "--text",
            "RETURN $x AS x",
            "-p",
            "x=1",
            "-p",
            "y=two",
            "--tier",
            "search",
        ])
        .unwrap();
        assert_eq!(cli.backend, Backend::Memory);
        match cli.command {
            Command::Query { params, tier, repeat, .. } => {
                assert_eq!(params.len(), 2);
                assert_eq!(tier, Some(Tier::Search));
                assert_eq!(repeat, 1);
            }
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn seed_requires_memory_backend() {
        let cli = Cli::try_parse_from(["graphgate-probe", "--seed", "x.json", "health"]).unwrap();
        assert!(factory(&cli, &AccessConfig::default()).is_err());
    }
}
