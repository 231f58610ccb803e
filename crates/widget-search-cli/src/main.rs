use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use widget_search_api::{
    FilterSearchRequest, PriceRangeSearchRequest, SearchRequest, WidgetSearchApi,
    API_CONTRACT_VERSION,
};
use widget_search_core::{FilterPolicy, NewWidget, Widget};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "wsearch")]
#[command(about = "Widget search CLI")]
struct Cli {
    #[arg(long, default_value = "./widgets.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Widget {
        #[command(subcommand)]
        command: WidgetCommand,
    },
    Query {
        #[command(subcommand)]
        command: QueryCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    /// Insert the demo catalogue into an empty database.
    Seed,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum WidgetCommand {
    Add(WidgetAddArgs),
    List,
}

#[derive(Debug, Args)]
struct WidgetAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    price: f64,
    #[arg(long, default_value_t = false)]
    disabled: bool,
}

#[derive(Debug, Subcommand)]
enum QueryCommand {
    Search(QuerySearchArgs),
    Filter(QueryFilterArgs),
    PriceRange(QueryPriceRangeArgs),
}

#[derive(Debug, Args)]
struct QuerySearchArgs {
    #[arg(long)]
    term: String,
}

#[derive(Debug, Args)]
struct QueryFilterArgs {
    #[arg(long, value_enum)]
    policy: PolicyArg,
    #[arg(long)]
    term: String,
    #[arg(long)]
    filter: String,
}

#[derive(Debug, Args)]
struct QueryPriceRangeArgs {
    #[arg(long)]
    term: String,
    #[arg(long, allow_hyphen_values = true)]
    min_price: String,
    #[arg(long, allow_hyphen_values = true)]
    max_price: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Unsafe,
    Safer,
    Safest,
}

impl From<PolicyArg> for FilterPolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::Unsafe => Self::Unsafe,
            PolicyArg::Safer => Self::Safer,
            PolicyArg::Safest => Self::Safest,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit_widgets(widgets: &[Widget]) -> Result<()> {
    emit_json(serde_json::json!({
        "api_contract_version": API_CONTRACT_VERSION,
        "count": widgets.len(),
        "widgets": widgets
    }))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = WidgetSearchApi::new(cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Widget { command } => run_widget(command, &api),
        Command::Query { command } => run_query(command, &api),
    }
}

fn run_db(command: DbCommand, api: &WidgetSearchApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::Seed => emit_json(serde_json::to_value(api.seed_fixtures()?)?),
    }
}

fn run_widget(command: WidgetCommand, api: &WidgetSearchApi) -> Result<()> {
    match command {
        WidgetCommand::Add(args) => {
            let widget = api.add_widget(NewWidget {
                name: args.name,
                price: args.price,
                enabled: !args.disabled,
            })?;
            emit_json(serde_json::json!({ "widget": widget }))
        }
        WidgetCommand::List => emit_widgets(&api.list_widgets()?),
    }
}

fn run_query(command: QueryCommand, api: &WidgetSearchApi) -> Result<()> {
    let widgets = match command {
        QueryCommand::Search(args) => api.search(&SearchRequest { term: args.term })?,
        QueryCommand::Filter(args) => api.filtered_search(
            args.policy.into(),
            &FilterSearchRequest { term: args.term, filter: args.filter },
        )?,
        QueryCommand::PriceRange(args) => api.impermeable_search(&PriceRangeSearchRequest {
            term: args.term,
            min_price: args.min_price,
            max_price: args.max_price,
        })?,
    };
    emit_widgets(&widgets)
}
