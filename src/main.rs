use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proxy_broker::{
    Broker, Candidate, Config, FindQuery, GeoLocator, GeoLookup, Provider, Proxy, ProxyType,
    RunStats, StaticProvider, TypeFilter,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Capacity of the queue between the broker and the printer
const QUEUE_SIZE: usize = 100;

/// Find, check and grab public proxies
#[derive(Parser)]
#[command(name = "proxy-broker")]
#[command(about = "Find, check and grab public proxies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// GeoLite2/GeoIP2 database used to locate proxies
    #[arg(long, global = true)]
    mmdb: Option<PathBuf>,

    /// Judge URLs replacing the configured ones (can specify multiple)
    #[arg(short, long, global = true)]
    judge: Vec<String>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Find and check proxies from the providers
    Find {
        /// Types with optional levels, e.g. http:high or socks5
        #[arg(short, long, num_args = 1..)]
        types: Vec<TypeFilter>,
        /// ISO country codes
        #[arg(long, num_args = 1..)]
        countries: Vec<String>,
        /// Require every requested type instead of at least one
        #[arg(long)]
        strict: bool,
        /// Number of working proxies to find
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output file for working proxies
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check proxies listed in a file
    Check {
        /// Input file containing proxies
        input: PathBuf,
        /// Types with optional levels, e.g. http:high or socks5
        #[arg(short, long, num_args = 1..)]
        types: Vec<TypeFilter>,
        /// Require every requested type instead of at least one
        #[arg(long)]
        strict: bool,
        /// Output file for working proxies
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Collect proxies from the providers without checking them
    Grab {
        /// ISO country codes
        #[arg(long, num_args = 1..)]
        countries: Vec<String>,
        /// Number of proxies to grab, 0 for all
        #[arg(short, long, default_value = "0")]
        limit: usize,
        /// Output file for grabbed proxies
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::from_yaml_file(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => Config::default(),
    };
    if !cli.judge.is_empty() {
        config.broker.judges = cli.judge.clone();
    }
    let geo = match &cli.mmdb {
        Some(path) => Some(Arc::new(GeoLocator::from_path(path)?) as Arc<dyn GeoLookup>),
        None => None,
    };

    match cli.command {
        Commands::Find {
            types,
            countries,
            strict,
            limit,
            output,
        } => {
            let query = FindQuery::new()
                .with_types(types)
                .with_countries(countries)
                .with_strict(strict)
                .with_limit(limit);
            let (tx, rx) = mpsc::channel(QUEUE_SIZE);
            let broker = with_geo(Broker::new(tx, config.broker)?, geo);

            let (proxies, stats) = collect(broker, query, rx).await?;
            report(&proxies, &stats, output.as_deref())?;
        }
        Commands::Check {
            input,
            types,
            strict,
            output,
        } => {
            let hints: Vec<ProxyType> = types.iter().map(|t| t.proxy_type).collect();
            let provider = StaticProvider::from_file(&input, &hints)?;
            println!("Loaded {} proxies from {:?}", provider.len(), input);

            let query = FindQuery::new().with_types(types).with_strict(strict);
            let (tx, rx) = mpsc::channel(QUEUE_SIZE);
            let broker = Broker::new(tx, config.broker)?
                .with_providers(vec![Arc::new(provider) as Arc<dyn Provider>]);
            let broker = with_geo(broker, geo);

            let (proxies, stats) = collect(broker, query, rx).await?;
            report(&proxies, &stats, output.as_deref())?;
        }
        Commands::Grab {
            countries,
            limit,
            output,
        } => {
            let (tx, _rx) = mpsc::channel(1);
            let broker = with_geo(
                Broker::new(tx, config.broker)?.with_judges(Vec::new()),
                geo,
            );
            let candidates = broker.grab(&countries, limit).await?;

            println!("Grabbed {} proxies", candidates.len());
            let lines: Vec<String> = candidates.iter().map(grab_line).collect();
            match output {
                Some(path) => {
                    std::fs::write(&path, lines.join("\n") + "\n")?;
                    println!("Saved proxies to {:?}", path);
                }
                None => {
                    for line in &lines {
                        println!("{}", line);
                    }
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "proxy_broker=debug"
    } else {
        "proxy_broker=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn with_geo(broker: Broker, geo: Option<Arc<dyn GeoLookup>>) -> Broker {
    match geo {
        Some(geo) => broker.with_geo(geo),
        None => broker,
    }
}

/// Run the broker and print proxies as they are found
async fn collect(
    broker: Broker,
    query: FindQuery,
    mut rx: mpsc::Receiver<Proxy>,
) -> Result<(Vec<Proxy>, RunStats)> {
    let run = tokio::spawn(async move { broker.find(query).await });

    let mut proxies = Vec::new();
    while let Some(proxy) = rx.recv().await {
        println!("{}", proxy);
        proxies.push(proxy);
    }

    let stats = run.await??;
    Ok((proxies, stats))
}

fn report(proxies: &[Proxy], stats: &RunStats, output: Option<&Path>) -> Result<()> {
    println!("\nResults: {}", stats);

    if let Some(path) = output {
        let lines: Vec<String> = proxies.iter().map(Proxy::to_simple_string).collect();
        std::fs::write(path, lines.join("\n") + "\n")?;
        println!("Saved {} working proxies to {:?}", proxies.len(), path);
    }
    Ok(())
}

fn grab_line(candidate: &Candidate) -> String {
    match &candidate.geo {
        Some(geo) => format!("{} {}", candidate.to_simple_string(), geo),
        None => candidate.to_simple_string(),
    }
}
