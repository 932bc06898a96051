use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shellcache::cache::{CacheStorage, ResponseSource, SqliteStorage};
use shellcache::event::Host;
use shellcache::network::HttpFetcher;
use shellcache::{Agent, Config, RequestDescriptor};

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline app-shell cache: cache-first fetching with versioned generations")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./shellcache.yaml or $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Cache database path (overrides storage.path)
  #[arg(long, global = true)]
  db: Option<PathBuf>,

  /// Also write logs to a daily rolling file in this directory
  #[arg(long, global = true)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the current generation and activate it
  Start,
  /// Fetch URLs through the agent
  Fetch {
    /// Request method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Locators or URLs to request
    #[arg(required = true)]
    urls: Vec<String>,
  },
  /// List cache generations
  Generations,
  /// List entries of a generation
  Entries {
    /// Generation to list (default: current)
    #[arg(short, long)]
    generation: Option<String>,
  },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
  // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "shellcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_dir.as_ref());

  let config = Config::load(args.config.as_deref())?;

  let db_path = match args.db.or_else(|| config.storage.path.clone()) {
    Some(path) => path,
    None => SqliteStorage::default_path()?,
  };
  let storage = Arc::new(SqliteStorage::open_path(&db_path)?);
  info!(path = %db_path.display(), "cache database ready");

  match args.command {
    Command::Start => start(&config, storage).await,
    Command::Fetch { method, urls } => fetch(&config, storage, &method, urls).await,
    Command::Generations => {
      for name in storage.generations()? {
        let marker = if name == config.agent.generation { "*" } else { " " };
        println!("{} {}", marker, name);
      }
      Ok(())
    }
    Command::Entries { generation } => {
      let generation = generation.unwrap_or_else(|| config.agent.generation.clone());
      if !storage.contains(&generation)? {
        return Err(eyre!("Generation {} does not exist", generation));
      }
      for entry in storage.entries(&generation)? {
        println!(
          "{:<6} {:>3} {:>10}  {}  {}",
          entry.request.method.as_str(),
          entry.status,
          entry.size,
          entry.cached_at.format("%Y-%m-%d %H:%M:%S"),
          entry.request.url
        );
      }
      Ok(())
    }
  }
}

fn agent_for(
  config: &Config,
  storage: Arc<SqliteStorage>,
) -> Result<(Arc<Agent<SqliteStorage, HttpFetcher>>, Arc<HttpFetcher>)> {
  let fetcher = Arc::new(HttpFetcher::new(&config.network)?);
  let agent = Agent::new(config.agent.clone(), storage, Arc::clone(&fetcher));
  Ok((Arc::new(agent), fetcher))
}

async fn start(config: &Config, storage: Arc<SqliteStorage>) -> Result<()> {
  let (agent, fetcher) = agent_for(config, storage)?;
  let host = Host::spawn(agent, fetcher);

  let cached = host.install().await?;
  println!("installed {}: {} entries cached", config.agent.generation, cached);

  let report = host.activate().await?;
  for name in &report.deleted {
    println!("deleted stale generation {}", name);
  }
  for failure in &report.failed {
    eprintln!("warning: {}", failure);
  }
  Ok(())
}

async fn fetch(
  config: &Config,
  storage: Arc<SqliteStorage>,
  method: &str,
  urls: Vec<String>,
) -> Result<()> {
  let method: Method = method
    .to_uppercase()
    .parse()
    .map_err(|_| eyre!("Invalid request method: {}", method))?;

  let (agent, fetcher) = agent_for(config, storage)?;
  let host = Host::spawn(Arc::clone(&agent), fetcher);

  // An earlier run may already have installed this generation
  if agent.restore().await?.is_none() {
    host.install().await?;
    host.activate().await?;
  }

  let requests = urls.into_iter().map(|url| {
    let host = host.clone();
    let request = RequestDescriptor::new(method.clone(), url);
    async move {
      let label = request.to_string();
      (label, host.fetch(request).await)
    }
  });

  let mut failed = 0;
  for (label, outcome) in futures::future::join_all(requests).await {
    let source = match outcome.source {
      Some(ResponseSource::Cache) => "cache",
      Some(ResponseSource::Network) => "network",
      Some(ResponseSource::Fallback) => "fallback",
      None => "passthrough",
    };
    match outcome.result {
      Ok(response) => println!(
        "{:<11} {:>3} {:>10}  {}",
        source,
        response.status,
        response.body().len(),
        label
      ),
      Err(e) => {
        failed += 1;
        eprintln!("{:<11} ERR {}: {}", source, label, e);
      }
    }
  }

  if failed > 0 {
    return Err(eyre!("{} request(s) failed", failed));
  }
  Ok(())
}
