mod agent;
mod cache;
mod config;
mod event;
mod host;
mod logging;
mod net;
mod worker;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use agent::{Agent, AgentSettings, Notification};
use cache::{CacheBucket, CacheKey, CacheStorage, SqliteStorage};
use config::Config;
use event::{Dispatcher, Event};
use host::LocalHost;
use net::{HttpFetcher, Request};
use worker::Registration;

#[derive(Parser, Debug)]
#[command(name = "offline-agent")]
#[command(about = "Cache-first offline agent with versioned precaching")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-agent/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin the agent serves, e.g. http://localhost:8080
  #[arg(long)]
  origin: Option<String>,

  /// Cache database path (default: user data directory)
  #[arg(long)]
  database: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the asset list into the current version and activate it
  Install,
  /// Evict every other version and claim clients (the current version must be installed)
  Activate,
  /// Serve requests cache-first
  Fetch {
    /// Paths (or absolute URLs) to request
    #[arg(required = true)]
    paths: Vec<String>,
    /// Request method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Extra request header, "Name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Write response bodies to stdout
    #[arg(long)]
    body: bool,
  },
  /// List cache buckets
  Buckets,
  /// List entries of a bucket (default: the current version)
  Entries {
    #[arg(long)]
    bucket: Option<String>,
    /// Show only the entry stored for this path or URL
    #[arg(long)]
    url: Option<String>,
  },
  /// Post a JSON message to the agent
  Message { json: String },
  /// Deliver a push with an optional text payload
  Push { text: Option<String> },
  /// Click the push notification, optionally on an action
  Click {
    #[arg(long)]
    action: Option<String>,
  },
  /// Fire a background sync
  Sync { tag: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.log_file.as_deref())?;

  // Load configuration, command line wins over the file
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(database) = args.database {
    config.database = Some(database);
  }

  let storage = Arc::new(match &config.database {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  });
  let host = Arc::new(LocalHost::new());
  let fetcher = Arc::new(HttpFetcher::new(config.origin_url()?)?);
  let agent = Agent::new(
    CacheBucket::new(storage, config.cache_name.clone()),
    fetcher,
    host.clone(),
    AgentSettings::from_config(&config)?,
  );
  let dispatcher = Dispatcher::new(agent);

  let result = run(args.command, &config, &dispatcher, &host).await;
  dispatcher.shutdown().await;

  result
}

async fn run(
  command: Command,
  config: &Config,
  dispatcher: &Dispatcher<SqliteStorage>,
  host: &Arc<LocalHost>,
) -> Result<()> {
  let bucket = dispatcher.agent().bucket();

  match command {
    Command::Install => {
      let mut registration =
        Registration::new(Dispatcher::new(dispatcher.agent().clone()), host.clone());
      registration.start().await?;
      println!("{} {}", bucket.name(), registration.state());
    }
    Command::Activate => {
      dispatcher.run(Event::Activate).await?;
      println!(
        "{} activated, clients claimed: {}",
        bucket.name(),
        host.snapshot().clients_claimed
      );
    }
    Command::Fetch {
      paths,
      method,
      headers,
      body,
    } => {
      let method: Method = method
        .to_uppercase()
        .parse()
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

      let mut requests = Vec::with_capacity(paths.len());
      for path in &paths {
        let mut request = Request::new(method.clone(), config.resolve(path)?);
        for header in &headers {
          let (name, value) = parse_header(header)?;
          request = request.with_header(name, value);
        }
        requests.push(request);
      }

      // One task per request; they are in flight together
      let pending: Vec<_> = requests
        .into_iter()
        .map(|request| (request.description(), dispatcher.dispatch_fetch(request)))
        .collect();

      // Each request succeeds or fails on its own
      let mut failed = 0;
      let mut stdout = std::io::stdout().lock();
      for (description, handle) in pending {
        let result = match handle.await {
          Ok(Ok(result)) => result,
          Ok(Err(e)) => {
            failed += 1;
            eprintln!("{}: {:#}", description, e);
            continue;
          }
          Err(e) => {
            failed += 1;
            eprintln!("{}: fetch task did not complete: {}", description, e);
            continue;
          }
        };
        let response = &result.data;

        if body {
          stdout.write_all(&response.body)?;
        } else {
          writeln!(
            stdout,
            "{} {} {} {} ({} bytes, {}, cached {})",
            response.status,
            result.source.as_str(),
            response.response_type,
            description,
            response.body.len(),
            response.header("content-type").unwrap_or("-"),
            result
              .cached_at
              .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
              .unwrap_or_else(|| "-".to_string()),
          )?;
        }
      }
      stdout.flush()?;

      if failed > 0 {
        return Err(eyre!("{} of {} request(s) failed", failed, paths.len()));
      }
    }
    Command::Buckets => {
      let storage = bucket.storage();
      for name in storage.bucket_names()? {
        let marker = if name == bucket.name() { "*" } else { " " };
        let count = storage.count_entries(&name)?;
        println!("{} {} ({} entries)", marker, name, count);
      }
    }
    Command::Entries { bucket: name, url } => {
      let target = match name {
        Some(name) => bucket.sibling(name),
        None => bucket.clone(),
      };
      if !target.storage().has_bucket(target.name())? {
        return Err(eyre!("No cache bucket named {}", target.name()));
      }

      let entries = match url {
        Some(url) => {
          let request = Request::get(config.resolve(&url)?);
          let entry = target
            .get(&request)?
            .ok_or_else(|| eyre!("No entry for {} in {}", request.url, target.name()))?;
          vec![entry]
        }
        None => target.entries()?,
      };
      for entry in entries {
        println!(
          "{} {} {} {} bytes, cached {}",
          entry.response.status,
          entry.method,
          entry.url,
          entry.response.body.len(),
          entry.cached_at.format("%Y-%m-%d %H:%M:%S"),
        );
      }
    }
    Command::Message { json } => {
      let data: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Message is not valid JSON: {}", e))?;
      let mut registration =
        Registration::new(Dispatcher::new(dispatcher.agent().clone()), host.clone());
      registration.post_message(data).await?;
      println!("skip waiting requested: {}", host.skip_waiting_requested());
    }
    Command::Push { text } => {
      dispatcher.run(Event::Push { payload: text }).await?;
      for notification in host.snapshot().notifications {
        println!("{}", serde_json::to_string_pretty(&notification)?);
      }
    }
    Command::Click { action } => {
      let settings = dispatcher.agent().settings();
      let notification = Notification::for_push(&settings.notifications, None, Utc::now());
      dispatcher
        .run(Event::NotificationClick {
          notification,
          action,
        })
        .await?;

      let state = host.snapshot();
      println!("closed {} notification(s)", state.closed.len());
      for url in state.windows {
        println!("opened {}", url);
      }
    }
    Command::Sync { tag } => {
      dispatcher.run(Event::Sync { tag: tag.clone() }).await?;
      println!("sync {} settled", tag);
    }
  }

  Ok(())
}

/// Split a "Name: value" argument and check both halves are valid in HTTP.
fn parse_header(header: &str) -> Result<(String, String)> {
  let (name, value) = header
    .split_once(':')
    .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
  let (name, value) = (name.trim(), value.trim());

  HeaderName::from_bytes(name.as_bytes())
    .map_err(|e| eyre!("Invalid header name '{}': {}", name, e))?;
  HeaderValue::from_str(value).map_err(|e| eyre!("Invalid value for header {}: {}", name, e))?;

  Ok((name.to_string(), value.to_string()))
}
