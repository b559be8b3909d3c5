mod agent;
mod cache;
mod clock;
mod config;
mod db;
mod error;
mod event;
mod logging;
mod messages;
mod net;
mod query;
mod queue;
mod retry;
mod scheduler;
mod status;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use crate::agent::BackgroundAgent;
use crate::cache::RouteOutcome;
use crate::clock::SystemClock;
use crate::messages::AgentMessage;
use crate::net::{HttpTransport, Method, Request};
use crate::query::{QueryState, SuggestionQuery};
use crate::queue::Domain;
use crate::scheduler::{SyncTag, TriggerSource};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline-first request cache and mutation replay agent")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to sync against, overriding the config file
  #[arg(short, long)]
  base_url: Option<Url>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the background agent: JSON-line messages on stdin, broadcasts on stdout
  Agent,
  /// Send one request through the cache router
  Fetch {
    method: Method,
    /// Path or absolute URL
    url: String,
    /// Request body
    #[arg(long)]
    body: Option<String>,
  },
  /// Queue a JSON payload for a domain's sync endpoint
  Enqueue { domain: Domain, payload: String },
  /// Fire one tag, or every tag
  Sync { tag: Option<SyncTag> },
  /// Show sync status and queue lengths
  Status,
  /// Re-send logged failed requests
  RetryFailed,
  /// Drop every queued mutation of a domain
  Purge { domain: Domain },
  /// Fetch search suggestions; each term supersedes the previous one
  Suggest {
    #[arg(required = true)]
    terms: Vec<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref(), args.base_url)?;
  let _log_guard = logging::init(&config.log, &config.log_dir()?)?;

  let db = Arc::new(db::Database::open(&config.database_path()?)?);
  let transport = Arc::new(HttpTransport::new(&config.http)?);
  let agent = Arc::new(BackgroundAgent::new(
    &config,
    db,
    transport,
    Arc::new(SystemClock),
  )?);

  match args.command {
    Command::Agent => run_agent(agent).await,
    Command::Fetch { method, url, body } => {
      let mut request = Request::new(method, config.resolve(&url)?);
      if let Some(body) = body {
        request = request.with_body(body.into_bytes());
      }
      match agent.router().route(request).await? {
        RouteOutcome::Served(result) => {
          eprintln!(
            "{} ({:?}{})",
            result.data.status,
            result.source,
            if result.degraded { ", degraded" } else { "" }
          );
          println!("{}", String::from_utf8_lossy(&result.data.body));
        }
        RouteOutcome::Queued(mutation) => {
          println!("queued {} in {}", mutation.id, mutation.store_name);
        }
      }
      Ok(())
    }
    Command::Enqueue { domain, payload } => {
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
      let mutation = agent.queues().enqueue(domain, &payload)?;
      println!("queued {} in {}", mutation.id, mutation.store_name);
      Ok(())
    }
    Command::Sync { tag } => {
      let outcomes: Vec<_> = match tag {
        Some(tag) => agent
          .trigger(tag, TriggerSource::Manual)
          .await
          .into_iter()
          .collect(),
        None => agent.sync_all().await,
      };
      print_json(&outcomes)?;
      if outcomes.iter().all(|o| o.is_success()) {
        Ok(())
      } else {
        Err(eyre!("Sync left work behind"))
      }
    }
    Command::Status => {
      let mut queues = serde_json::Map::new();
      for queue in agent.queues().iter() {
        queues.insert(queue.store_name().to_string(), json!(queue.len()?));
      }
      print_json(&json!({
        "session": agent.status().snapshot(),
        "queues": queues,
        "failedSyncs": agent.failed().records()?.len(),
        "manualOnly": agent.scheduler().is_manual_only(),
      }))
    }
    Command::RetryFailed => print_json(&agent.retry_failed().await?),
    Command::Purge { domain } => {
      let removed = agent.queues().get(domain).purge()?;
      println!("removed {} from {}", removed, domain.store_name());
      Ok(())
    }
    Command::Suggest { terms } => {
      let mut query = SuggestionQuery::new(agent.router().clone(), agent.base_url().clone());
      for term in &terms {
        query.search(term);
      }
      match query.settle().await {
        QueryState::Success(suggestions) => print_json(suggestions),
        QueryState::Error(e) => Err(eyre!("Suggestions failed: {}", e)),
        QueryState::Idle | QueryState::Loading => Ok(()),
      }
    }
  }
}

async fn run_agent(agent: Arc<BackgroundAgent>) -> Result<()> {
  agent.install().await;
  agent.activate()?;

  // Broadcasts go to stdout, one JSON document per line
  let mut outbound = agent.subscribe();
  tokio::spawn(async move {
    loop {
      match outbound.recv().await {
        Ok(message) => match message.to_line() {
          Ok(line) => println!("{}", line),
          Err(e) => warn!("{}", e),
        },
        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "Dropped broadcasts for a slow reader");
        }
        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
      }
    }
  });

  let (tx, inbound) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      if line.trim().is_empty() {
        continue;
      }
      match AgentMessage::parse(&line) {
        Ok(message) => {
          if tx.send(message).is_err() {
            break;
          }
        }
        Err(e) => warn!("{}", e),
      }
    }
  });

  info!("Agent running");
  tokio::select! {
    result = agent.run(inbound) => result,
    _ = tokio::signal::ctrl_c() => {
      info!("Interrupted, shutting down");
      Ok(())
    }
  }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", text);
  Ok(())
}
