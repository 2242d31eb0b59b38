use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tally_client::{HttpClient, build_providers, default_settings};
use tally_core::os_signals::shutdown_signal;
use tally_core::{
    Alias, Item, ItemStore, PipelineConfig, Provider, ProviderSettings, QueueSelector, Supervisor,
    load_provider_settings,
};
use tally_db::{Database, DatabaseConfig, PgItemStore};

#[derive(Parser)]
#[command(name = "tally", version, about = "Collects impact metrics for research items")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, env = "TALLY_LOG_JSON", default_value_t = false)]
    log_json: bool,

    /// Provider settings file (JSON). Every known provider with defaults if omitted.
    #[arg(long, env = "TALLY_PROVIDERS")]
    providers: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the alias and metrics workers until interrupted
    Run,

    /// Queue items for collection, or refresh the ones that already exist
    Enqueue {
        /// Identifier as `namespace:id`, e.g. `doi:10.5061/dryad.8515`
        #[arg(short, long = "alias")]
        aliases: Vec<String>,

        /// Provider asked to expand `--query` into member identifiers
        #[arg(long, requires = "query")]
        from: Option<String>,

        /// Query handed to the `--from` provider
        #[arg(long, requires = "from")]
        query: Option<String>,
    },

    /// Print one item as JSON
    Show {
        /// Item id
        tiid: String,
    },

    /// Print how many items wait in each queue
    Queues,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let settings = provider_settings(cli.providers.as_deref())?;

    match cli.command {
        Commands::Run => cmd_run(&settings).await,
        Commands::Enqueue {
            aliases,
            from,
            query,
        } => {
            let store = connect_db(1).await?;
            let mut wanted = aliases
                .iter()
                .map(|raw| parse_alias(raw))
                .collect::<Result<Vec<_>>>()?;
            if let (Some(from), Some(query)) = (from, query) {
                wanted.extend(member_aliases(&settings, &from, &query).await?);
            }
            if wanted.is_empty() {
                bail!("Nothing to enqueue: pass --alias or --from/--query");
            }
            cmd_enqueue(&store, wanted).await
        }
        Commands::Show { tiid } => {
            let store = connect_db(1).await?;
            cmd_show(&store, &tiid).await
        }
        Commands::Queues => {
            let store = connect_db(1).await?;
            cmd_queues(&store, &settings).await
        }
    }
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("tally=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn provider_settings(path: Option<&std::path::Path>) -> Result<Vec<ProviderSettings>> {
    match path {
        Some(path) => load_provider_settings(path).map_err(|e| anyhow::anyhow!(e)),
        None => Ok(default_settings()),
    }
}

/// Connect to PostgreSQL using DATABASE_URL and bring the schema up to date.
async fn connect_db(workers: usize) -> Result<PgItemStore> {
    let config = DatabaseConfig::from_env()
        .map_err(|e| anyhow::anyhow!(e))?
        .with_min_connections_for(workers);

    let database = Database::open(&config)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to open item store")?;

    Ok(database.item_store())
}

fn parse_alias(raw: &str) -> Result<Alias> {
    let Some((namespace, id)) = raw.split_once(':') else {
        bail!("Invalid alias '{raw}': expected namespace:id");
    };
    if namespace.trim().is_empty() || id.trim().is_empty() {
        bail!("Invalid alias '{raw}': namespace and id must both be set");
    }
    Ok(Alias::new(namespace.trim(), id.trim()).normalized())
}

fn build(settings: &[ProviderSettings]) -> Result<Vec<Arc<dyn Provider>>> {
    let http = HttpClient::new().map_err(|e| anyhow::anyhow!(e))?;
    build_providers(settings, &http).map_err(|e| anyhow::anyhow!(e))
}

async fn member_aliases(
    settings: &[ProviderSettings],
    from: &str,
    query: &str,
) -> Result<Vec<Alias>> {
    let providers = build(settings)?;
    let Some(provider) = providers.iter().find(|p| p.name() == from) else {
        bail!("Provider '{from}' is not configured");
    };
    if !provider.descriptor().provides_members() {
        bail!("Provider '{from}' cannot list member items");
    }

    let members = provider
        .member_items(query)
        .await
        .map_err(|e| anyhow::anyhow!("{from} member lookup failed: {e}"))?;
    tracing::info!(provider = from, count = members.len(), "Member items found");
    Ok(members)
}

async fn cmd_run(settings: &[ProviderSettings]) -> Result<()> {
    let config = PipelineConfig::from_env()
        .map_err(|e| anyhow::anyhow!(e))?
        .with_provider_settings(settings);
    let providers = build(settings)?;

    let metrics_workers: usize = providers
        .iter()
        .filter(|p| p.descriptor().provides_metrics())
        .map(|p| config.metrics_workers_for(p.name()))
        .sum();
    let store = connect_db(config.alias_workers + metrics_workers).await?;

    tracing::info!(
        providers = providers.len(),
        alias_workers = config.alias_workers,
        metrics_workers,
        "Starting workers"
    );

    Supervisor::new(store, providers, config)
        .run(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!(e))
}

async fn cmd_enqueue(store: &PgItemStore, aliases: Vec<Alias>) -> Result<()> {
    let now = Utc::now();

    for alias in aliases {
        let existing = store
            .find_by_alias(&alias)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;

        let tiid = match existing {
            Some(tiid) => {
                let Some(mut item) = store.get(&tiid).await.map_err(|e| anyhow::anyhow!(e))? else {
                    bail!("Item {tiid} vanished while refreshing");
                };
                item.request_refresh(now);
                store.save(&item).await.map_err(|e| anyhow::anyhow!(e))?;
                tracing::info!(%tiid, %alias, "Refresh requested");
                tiid
            }
            None => {
                let item = store
                    .insert(&Item::new(now).with_aliases([alias.clone()]))
                    .await
                    .map_err(|e| anyhow::anyhow!(e))?;
                tracing::info!(tiid = %item.tiid, %alias, "Item created");
                item.tiid
            }
        };

        println!("{tiid}\t{alias}");
    }

    Ok(())
}

async fn cmd_show(store: &PgItemStore, tiid: &str) -> Result<()> {
    let item = store
        .get(tiid)
        .await
        .map_err(|e| anyhow::anyhow!(e))?
        .with_context(|| format!("No item with id {tiid}"))?;

    println!("{}", serde_json::to_string_pretty(&item)?);
    Ok(())
}

async fn cmd_queues(store: &PgItemStore, settings: &[ProviderSettings]) -> Result<()> {
    let mut selectors = vec![QueueSelector::NeedsAliases];
    for provider in build(settings)? {
        if provider.descriptor().provides_metrics() {
            selectors.push(QueueSelector::metrics(provider.name()));
        }
    }

    for selector in selectors {
        let count = store
            .count(&selector)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        println!("{:<32} {count}", selector.name());
    }
    Ok(())
}
