use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use argh::FromArgs;
use kubernetes::{ApiResource, DynamicObject, ListParams};
use tokio::runtime::Handle;
use tracing::{error, info};
use watchhub::config::Config;
use watchhub::consumer::{self, SnapshotCache};
use watchhub::transport::{ItemWatchParams, KubeTransport, ListEvent, ListWatchParams};
use watchhub::{Handler, QueryKey, Registration, RegistryProvider, trace};

#[derive(FromArgs)]
/// Watch Kubernetes resources through shared, reference counted subscriptions.
struct RootCommand {
    /// show version and exit
    #[argh(switch, short = 'v')]
    version: bool,

    /// path to the configuration file
    #[argh(
        option,
        short = 'c',
        default = "PathBuf::from(\"/etc/watchhub/config.yaml\")"
    )]
    config: PathBuf,

    /// log level, one of off, error, warn, info, debug and trace
    #[argh(option)]
    log_level: Option<String>,

    #[argh(subcommand)]
    command: Option<Command>,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    List(ListCommand),
    Item(ItemCommand),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "list")]
/// Watch a collection of resources.
struct ListCommand {
    /// cluster name, as configured
    #[argh(option)]
    cluster: String,

    /// namespace, all namespaces if omitted
    #[argh(option, short = 'n')]
    namespace: Option<String>,

    /// API group, empty for the core group
    #[argh(option, default = "String::new()")]
    group: String,

    /// API version
    #[argh(option, default = "String::from(\"v1\")")]
    api_version: String,

    /// kind of the resource
    #[argh(option, default = "String::new()")]
    kind: String,

    /// label to select on, `key=value`, repeatable
    #[argh(option, short = 'l')]
    label: Vec<String>,

    /// resume after this resource version instead of listing first
    #[argh(option)]
    resource_version: Option<String>,

    /// plural name of the resource, e.g. `pods`
    #[argh(positional)]
    plural: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "item")]
/// Watch a single object.
struct ItemCommand {
    /// cluster name, as configured
    #[argh(option)]
    cluster: String,

    /// namespace of the object
    #[argh(option, short = 'n')]
    namespace: Option<String>,

    /// API group, empty for the core group
    #[argh(option, default = "String::new()")]
    group: String,

    /// API version
    #[argh(option, default = "String::from(\"v1\")")]
    api_version: String,

    /// kind of the resource
    #[argh(option, default = "String::new()")]
    kind: String,

    /// resume after this resource version
    #[argh(option)]
    resource_version: Option<String>,

    /// plural name of the resource, e.g. `deployments`
    #[argh(positional)]
    plural: String,

    /// name of the object
    #[argh(positional)]
    name: String,
}

impl ListCommand {
    fn query(&self) -> watchhub::Result<QueryKey> {
        let resource = ApiResource::new(&self.group, &self.api_version, &self.kind, &self.plural);
        let mut query = QueryKey::new(&self.cluster, resource);
        if let Some(namespace) = &self.namespace {
            query = query.namespace(namespace);
        }

        for label in &self.label {
            let (key, value) = label
                .split_once('=')
                .ok_or_else(|| format!("invalid label {label:?}, want key=value"))?;
            query = query.label(key, value);
        }

        Ok(query)
    }
}

impl ItemCommand {
    fn query(&self) -> QueryKey {
        let resource = ApiResource::new(&self.group, &self.api_version, &self.kind, &self.plural);
        let mut query = QueryKey::new(&self.cluster, resource).name(&self.name);
        if let Some(namespace) = &self.namespace {
            query = query.namespace(namespace);
        }

        query
    }
}

fn main() {
    let opts: RootCommand = argh::from_env();

    if opts.version {
        println!("watchhub {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let Some(command) = opts.command else {
        eprintln!("a subcommand is required, see --help");
        std::process::exit(exitcode::USAGE);
    };

    let config = match Config::load(&opts.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(exitcode::CONFIG);
        }
    };

    let level = opts
        .log_level
        .as_deref()
        .or(config.log_level.as_deref())
        .unwrap_or("info");
    let levels = trace::levels(level);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .thread_name("watchhub-worker")
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("build runtime failed, {err}");
            std::process::exit(exitcode::OSERR);
        }
    };

    let code = runtime.block_on(async move {
        trace::init(std::io::stdout().is_terminal(), &levels);

        match run(config, command).await {
            Ok(()) => exitcode::OK,
            Err(err) => {
                error!(message = "watch failed", %err);
                exitcode::SOFTWARE
            }
        }
    });

    std::process::exit(code);
}

async fn run(config: Config, command: Command) -> watchhub::Result<()> {
    let transport = Arc::new(KubeTransport::from_config(&config, Handle::current())?);
    let provider = RegistryProvider::new(Some(transport.clone()));
    provider.set_authenticated(true);

    let cache = Arc::new(SnapshotCache::new());

    let (registrations, summary) = match command {
        Command::List(cmd) => {
            let query = cmd.query()?;
            let version = match cmd.resource_version {
                Some(version) => Some(version),
                None => initial_list(&transport, &query, &cache).await?,
            };

            let registrations = vec![
                print_list_events(&provider, &query)?,
                consumer::watch_list(&provider, &query, version.as_deref(), cache.clone())
                    .ok_or("not authenticated")?,
            ];

            let cache = Arc::clone(&cache);
            let key = query.registry_key();
            let summary: Box<dyn Fn() -> String> =
                Box::new(move || format!("{} objects", cache.list(&key).len()));

            (registrations, summary)
        }
        Command::Item(cmd) => {
            let query = cmd.query();
            let registrations = vec![
                print_item_events(&provider, &query)?,
                consumer::watch_item(
                    &provider,
                    &query,
                    cmd.resource_version.as_deref(),
                    cache.clone(),
                )
                .ok_or("not authenticated")?,
            ];

            let cache = Arc::clone(&cache);
            let key = query.registry_key();
            let summary: Box<dyn Fn() -> String> = Box::new(move || match cache.item(&key) {
                Some(obj) => format!(
                    "resource version {}",
                    obj.metadata.resource_version.unwrap_or_default()
                ),
                None => "no snapshot".to_string(),
            });

            (registrations, summary)
        }
    };

    tokio::signal::ctrl_c().await?;

    info!(message = "shutting down", snapshot = summary());

    for registration in &registrations {
        registration.unregister();
    }
    provider.set_authenticated(false);

    Ok(())
}

const LIST_PAGE_SIZE: u32 = 500;

/// Lists the collection page by page, seeding the cache, and returns the
/// version the watch resumes from.
async fn initial_list(
    transport: &KubeTransport,
    query: &QueryKey,
    cache: &SnapshotCache,
) -> watchhub::Result<Option<String>> {
    let client = transport
        .client(&query.cluster)
        .ok_or_else(|| format!("unknown cluster {:?}", query.cluster))?;

    let mut params = ListParams {
        label_selector: query.label_selector(),
        limit: Some(LIST_PAGE_SIZE),
        continue_token: None,
    };
    let mut objects = Vec::new();
    let resource_version = loop {
        let list = client
            .list::<DynamicObject>(&query.resource, query.namespace.as_deref(), &params)
            .await?;
        objects.extend(list.items);

        match list.metadata.continue_token.filter(|token| !token.is_empty()) {
            Some(token) => params.continue_token = Some(token),
            None => break list.metadata.resource_version,
        }
    };

    info!(
        message = "initial list done",
        objects = objects.len(),
        resource_version = resource_version.as_deref().unwrap_or_default()
    );

    cache.seed_list(&query.registry_key(), objects);

    Ok(resource_version)
}

fn print_list_events(
    provider: &RegistryProvider,
    query: &QueryKey,
) -> watchhub::Result<Registration> {
    let registry = provider.list_watch_registry().ok_or("not authenticated")?;
    let handler = Handler::new(|event: &ListEvent| {
        println!(
            "{:?}\t{}\t{}",
            event.kind,
            event.object.metadata.name().unwrap_or_default(),
            event.object.metadata.resource_version.as_deref().unwrap_or_default()
        );
        Ok(())
    });

    Ok(registry.register(query, ListWatchParams::new(query), handler))
}

fn print_item_events(
    provider: &RegistryProvider,
    query: &QueryKey,
) -> watchhub::Result<Registration> {
    let registry = provider.item_watch_registry().ok_or("not authenticated")?;
    let handler = Handler::new(|object: &DynamicObject| {
        println!("{}", serde_json::to_string(object)?);
        Ok(())
    });

    Ok(registry.register(query, ItemWatchParams::new(query), handler))
}
