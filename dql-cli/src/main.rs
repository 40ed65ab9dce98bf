use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use dql_api::explain;
use dql_core::config::EngineConfig;
use dql_core::expression::translate;
use dql_core::lang::{DqlParser, Statement};
use dql_core::planner::{Planner, PlannerOptions};
use dql_core::schema::TableMeta;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod table;

#[derive(Parser)]
#[command(name = "dql")]
#[command(about = "DQL statement parser and planner", long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset (e.g. debug, dql_core=trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse statements and print their syntax tree
    Parse {
        /// One or more statements separated by ';'
        text: String,
    },
    /// Translate a condition into a store expression with placeholders
    Translate {
        /// Condition, e.g. "id = 'a' AND ts > 3"
        condition: String,
    },
    /// Plan statements against table metadata and show the store requests
    Plan {
        /// JSON file holding one table description or an array of them
        #[arg(short, long)]
        schema: PathBuf,
        /// Fall back to a scan when no index fits
        #[arg(long)]
        allow_scan: bool,
        /// Reject ORDER BY on non-key attributes combined with LIMIT
        #[arg(long)]
        strict_ordering: bool,
        /// Items requested per page
        #[arg(long)]
        page_size: Option<usize>,
        /// One or more statements separated by ';'
        text: String,
    },
    /// Print the CREATE TABLE statements for a schema file
    Schema {
        /// JSON file holding one table description or an array of them
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log level")?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Parse { text } => {
            let statements = DqlParser::parse(&text).context("Failed to parse statements")?;
            for statement in &statements {
                println!(
                    "{} {}",
                    statement.kind(),
                    statement.table().unwrap_or("*")
                );
                println!("{:#?}", statement);
            }
        }

        Commands::Translate { condition } => {
            let predicate = DqlParser::parse_condition(&condition).context("Failed to parse condition")?;
            let (expression, context) = translate(&predicate).context("Failed to translate condition")?;
            println!("{}", expression);
            println!("{}", table::format_bindings(&context));
        }

        Commands::Plan {
            schema,
            allow_scan,
            strict_ordering,
            page_size,
            text,
        } => {
            let tables = load_schema(&schema)?;
            let mut config = EngineConfig::default()
                .with_allow_scan(allow_scan)
                .with_strict_ordering(strict_ordering);
            if let Some(size) = page_size {
                config = config.with_page_size(size);
            }
            config.validate().map_err(|e| anyhow!("Invalid configuration: {}", e))?;

            let statements = DqlParser::parse(&text).context("Failed to parse statements")?;
            for statement in &statements {
                plan_statement(&tables, statement, &config)?;
            }
        }

        Commands::Schema { path } => {
            for meta in load_schema(&path)? {
                println!("{}", meta.schema());
            }
        }
    }

    Ok(())
}

fn plan_statement(tables: &[TableMeta], statement: &Statement, config: &EngineConfig) -> Result<()> {
    let name = statement
        .table()
        .ok_or_else(|| anyhow!("{} statements have no read plan", statement.kind()))?;
    let meta = tables
        .iter()
        .find(|meta| meta.name == name)
        .ok_or_else(|| anyhow!("Table '{}' is not in the schema file", name))?;

    let plan = Planner::new(meta, PlannerOptions::from(config))
        .plan(statement)
        .with_context(|| format!("Failed to plan {} on '{}'", statement.kind(), name))?;
    debug!(table = name, kind = %plan.kind, index = plan.index_label(), "planned");

    println!("{}", table::format_plan(&plan));
    for line in explain::read_lines(meta, &plan, config)? {
        println!("  {}", line);
    }
    println!();
    Ok(())
}

fn load_schema(path: &Path) -> Result<Vec<TableMeta>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file {}", path.display()))?;
    let json: serde_json::Value = serde_json::from_str(&text).context("Invalid JSON")?;

    let tables: Vec<TableMeta> = match json {
        serde_json::Value::Array(_) => serde_json::from_value(json),
        _ => serde_json::from_value(json).map(|meta| vec![meta]),
    }
    .context("Schema file does not describe tables")?;

    if tables.is_empty() {
        bail!("Schema file {} holds no tables", path.display());
    }
    for meta in &tables {
        meta.validate()
            .with_context(|| format!("Invalid table '{}'", meta.name))?;
    }
    Ok(tables)
}
