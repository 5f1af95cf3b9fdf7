//! waddle-pubsub - run PubSub requests against a local node database.
//!
//! Every `request` invocation is dispatched through the same pipeline a
//! server would use; frontend hooks for the `xmpp` scheme are logged.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use minidom::Element;
use tokio::sync::mpsc;
use tracing::{debug, info};
use waddle_pubsub::{
    ConfigUpdate, DefaultItemNormalizer, DispatchError, FeatureRegistry, FrontendHookRegistry,
    LibSqlStorage, PubSubConfig, Request, RequestDispatcher, RsmQuery,
};

mod frontend;
mod telemetry;

/// Waddle PubSub - node engine command line
#[derive(Parser)]
#[command(name = "waddle-pubsub")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: <config dir>/waddle/pubsub.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding the configuration
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Trace-level engine logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the supported features
    Features,
    /// List every identity holding a subscription
    Subscribers,
    /// Dispatch a single request
    Request(RequestArgs),
}

#[derive(Args)]
struct RequestArgs {
    /// Requester identity URI (e.g. xmpp:alice@example.com)
    #[arg(long)]
    from: String,

    /// Feature name (e.g. publish)
    #[arg(long)]
    feature: String,

    /// Operation within the feature (e.g. publish)
    #[arg(long)]
    operation: String,

    /// Node path
    #[arg(short, long)]
    node: Option<String>,

    /// Item to publish as <id>=<xml>; an empty id lets the server pick one
    #[arg(long = "item", value_name = "ID=XML")]
    items: Vec<String>,

    /// Item id to retract
    #[arg(long = "item-id", value_name = "ID")]
    item_ids: Vec<String>,

    /// Page after this item id
    #[arg(long)]
    after: Option<String>,

    /// Page before this item id
    #[arg(long)]
    before: Option<String>,

    /// Maximum number of items
    #[arg(long)]
    max: Option<usize>,

    #[arg(long)]
    title: Option<String>,

    #[arg(long)]
    description: Option<String>,

    #[arg(long = "type")]
    node_type: Option<String>,

    #[arg(long)]
    access_model: Option<String>,

    #[arg(long)]
    publish_model: Option<String>,

    /// Subscription change as <user>=<state>
    #[arg(long = "subscription", value_name = "USER=STATE")]
    subscriptions: Vec<String>,

    /// Affiliation change as <user>=<role>
    #[arg(long = "affiliation", value_name = "USER=ROLE")]
    affiliations: Vec<String>,

    /// Replay window start (RFC 3339)
    #[arg(long)]
    start: Option<DateTime<Utc>>,

    /// Replay window end (RFC 3339)
    #[arg(long)]
    end: Option<DateTime<Utc>>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    let config = load_config(&cli)?;
    let dispatcher = build_dispatcher(&config, cli.database.as_ref()).await?;

    match cli.command {
        Commands::Features => {
            for name in dispatcher.features().feature_names() {
                println!("{}", name);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Subscribers => {
            let subscribers = dispatcher
                .all_subscribers()
                .await
                .context("Failed to list subscribers")?;
            for subscriber in subscribers {
                println!("{}", subscriber);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Request(args) => run_request(&dispatcher, args).await,
    }
}

fn load_config(cli: &Cli) -> Result<PubSubConfig> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => dirs::config_dir()
            .context("Could not determine config directory")?
            .join("waddle")
            .join("pubsub.toml"),
    };
    let config = PubSubConfig::load(&path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    Ok(config.apply_env())
}

async fn build_dispatcher(
    config: &PubSubConfig,
    database: Option<&PathBuf>,
) -> Result<RequestDispatcher> {
    let path = match database.or(config.database_path.as_ref()) {
        Some(path) => path.clone(),
        None => dirs::data_dir()
            .context("Could not determine data directory")?
            .join("waddle")
            .join("pubsub.db"),
    };
    info!("Opening PubSub database at {:?}", path);
    let storage = LibSqlStorage::open(&path)
        .await
        .with_context(|| format!("Failed to open database {:?}", path))?;

    let features = FeatureRegistry::standard(config, Arc::new(DefaultItemNormalizer));
    let hooks = FrontendHookRegistry::new();
    hooks.register(frontend::SCHEME, frontend::logging_hooks());

    Ok(RequestDispatcher::new(
        Arc::new(storage),
        Arc::new(features),
        Arc::new(hooks),
    ))
}

async fn run_request(dispatcher: &RequestDispatcher, args: RequestArgs) -> Result<ExitCode> {
    let replay = args.operation == "replay";
    let (start, end) = (args.start, args.end);
    let mut request = build_request(args)?;

    // Replayed items are printed while the transaction still runs
    let printer = if replay {
        let (tx, mut rx) = mpsc::unbounded_channel();
        request = request.with_replay(start, end, tx);
        Some(tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match serde_json::to_string(&item) {
                    Ok(line) => println!("{}", line),
                    Err(e) => eprintln!("error: could not encode replayed item: {}", e),
                }
            }
        }))
    } else {
        None
    };

    let outcome = dispatcher.handle(request).await;
    if let Some(printer) = printer {
        printer.await.context("Replay printer failed")?;
    }

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            report(&e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn report(e: &DispatchError) {
    eprintln!("error: {}: {}", e.condition(), e);
    eprintln!("trace: {}", e.trace);
}

fn build_request(args: RequestArgs) -> Result<Request> {
    let mut request = Request::new(args.from, args.feature, args.operation);
    if let Some(node) = args.node {
        request = request.with_node(node);
    }

    for item in &args.items {
        let (id, xml) = split_pair(item, "item")?;
        let payload: Element = xml
            .parse()
            .with_context(|| format!("Item {:?} is not valid XML", id))?;
        let id = Some(id).filter(|id| !id.is_empty());
        request = request.with_item(id, payload);
    }
    for id in args.item_ids {
        request = request.with_item_id(id);
    }

    if args.after.is_some() || args.before.is_some() || args.max.is_some() {
        request = request.with_rsm(RsmQuery {
            after: args.after,
            before: args.before,
            count: args.max,
        });
    }

    request = request.with_config(ConfigUpdate {
        title: args.title,
        description: args.description,
        node_type: args.node_type,
        access_model: args.access_model,
        publish_model: args.publish_model,
    });

    for pair in &args.subscriptions {
        let (user, state) = split_pair(pair, "subscription")?;
        request = request.with_subscription(user, state);
    }
    for pair in &args.affiliations {
        let (user, role) = split_pair(pair, "affiliation")?;
        request = request.with_affiliation(user, role);
    }

    debug!(
        items = args.items.len(),
        subscriptions = args.subscriptions.len(),
        affiliations = args.affiliations.len(),
        "Request built"
    );
    Ok(request)
}

/// Split `<key>=<value>` at the first `=`.
fn split_pair<'a>(pair: &'a str, what: &str) -> Result<(&'a str, &'a str)> {
    match pair.split_once('=') {
        Some(split) => Ok(split),
        None => bail!("Expected <key>=<value> for {}, got {:?}", what, pair),
    }
}
