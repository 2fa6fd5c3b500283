use clap::{ArgAction, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::time::Duration;

use outpost::commands::{self, Action as WatchAction, COMMANDS};
use outpost::connectivity::ConnectivityEvent;
use outpost::event::{Event, EventHandler};
use outpost::http::ResponseSource;
use outpost::sync::QueuedRequest;
use outpost::{logging, Config, PortalClient, SubmitOutcome};

#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(about = "Offline-capable client for the constituency portal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/outpost/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Portal base URL, overriding the config file
  #[arg(long, env = "OUTPOST_SERVER")]
  server: Option<String>,

  /// Start with the device network reported down
  #[arg(long)]
  device_offline: bool,

  /// Log to stderr (-v debug, -vv trace)
  #[arg(short, long, action = ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
  /// Fetch a path through the offline layer
  Get {
    path: String,
    /// Fetch as a page navigation
    #[arg(long)]
    html: bool,
  },
  /// Submit a JSON document, queueing it if the server is unreachable
  Submit {
    json: String,
    #[arg(long, default_value = "/api/feedback")]
    path: String,
  },
  /// Show connection state and queue size
  Status,
  /// List queued writes
  Pending,
  /// Replay queued writes now
  Sync,
  /// Drop cached responses, or queued writes with --mutations
  Clear {
    #[arg(long)]
    mutations: bool,
  },
  /// Precache the offline shell and drop old cache namespaces
  Install,
  /// Follow connectivity and accept device signals on stdin
  Watch {
    /// Seconds between liveness probes
    #[arg(long)]
    interval: Option<u64>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref(), args.server.as_deref())?;
  let _log_guard = logging::init(&config.log, args.verbose)?;

  let client = PortalClient::new(&config, !args.device_offline)?;
  client.monitor().check_now().await;

  match args.action {
    Action::Get { path, html } => get(&client, &path, html).await?,
    Action::Submit { json, path } => submit(&client, &path, &json).await?,
    Action::Status => status(&client).await?,
    Action::Pending => pending(&client).await?,
    Action::Sync => sync(&client).await?,
    Action::Clear { mutations } => {
      let removed = if mutations {
        client.store().clear_mutations().await?
      } else {
        client.store().clear().await?
      };
      println!("Removed {} entries", removed);
    }
    Action::Install => {
      let report = client.interceptor().install().await?;
      println!(
        "Cached {} resources, removed {} entries from old caches",
        report.cached, report.purged
      );
    }
    Action::Watch { interval } => {
      let interval = interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.probe.interval());
      watch(&client, interval).await?;
    }
  }

  // Let a replay started by the initial probe finish before exiting
  tokio::task::yield_now().await;
  client.sync().wait_idle().await;
  client.interceptor().flush().await;

  Ok(())
}

async fn get(client: &PortalClient, path: &str, html: bool) -> Result<()> {
  let response = client.get(path, html).await?;
  let source = match response.source {
    ResponseSource::Network => "network".to_string(),
    ResponseSource::Cache { stored_at } => format!("cache, stored {}", stored_at),
    ResponseSource::Synthetic => "offline placeholder".to_string(),
    ResponseSource::Queued { id } => format!("queued as #{}", id),
  };
  eprintln!("{} ({})", response.status, source);
  println!("{}", response.text());
  Ok(())
}

async fn submit(client: &PortalClient, path: &str, json: &str) -> Result<()> {
  let body: serde_json::Value =
    serde_json::from_str(json).map_err(|e| eyre!("Invalid JSON document: {}", e))?;

  match client.submit(path, &body).await? {
    SubmitOutcome::Delivered { status, body } => println!("Delivered ({}): {}", status, body),
    SubmitOutcome::Queued { id, message } => println!("Queued as #{}: {}", id, message),
  }
  Ok(())
}

async fn status(client: &PortalClient) -> Result<()> {
  let snapshot = client.monitor().snapshot();
  println!("State:       {}", snapshot.state);
  println!("             {}", snapshot.state.description());
  println!(
    "Device:      {}",
    if snapshot.device_online { "up" } else { "down" }
  );
  match snapshot.server_reachable {
    Some(true) => println!("Server:      reachable"),
    Some(false) => println!("Server:      unreachable"),
    None => println!("Server:      unknown"),
  }
  if let Some(at) = snapshot.last_known_good {
    println!("Last online: {}", at);
  }
  println!("Queued:      {}", client.pending().await?.len());
  Ok(())
}

async fn pending(client: &PortalClient) -> Result<()> {
  let mutations = client.pending().await?;
  if mutations.is_empty() {
    println!("No queued writes");
    return Ok(());
  }

  for mutation in mutations {
    match QueuedRequest::from_payload(&mutation.payload) {
      Ok(queued) => println!(
        "#{:<4} {}  {} {}  {}",
        mutation.id, mutation.enqueued_at, queued.method, queued.path, queued.body
      ),
      Err(_) => println!("#{:<4} {}  <unreadable>", mutation.id, mutation.enqueued_at),
    }
  }
  Ok(())
}

async fn sync(client: &PortalClient) -> Result<()> {
  let state = client.monitor().state();
  if let Some(reason) = state.offline_reason() {
    println!("{}; queued writes will be sent when connectivity returns", reason);
    return Ok(());
  }

  let report = client.sync().run_pass().await?;
  if report.skipped {
    println!("A replay is already running");
  } else {
    println!("Synced {}, {} still queued", report.synced, report.failed);
  }
  Ok(())
}

async fn watch(client: &PortalClient, interval: Duration) -> Result<()> {
  let monitor = client.monitor();
  let periodic = monitor.start_periodic(interval);

  let mut events = EventHandler::new();
  events.forward_connectivity(monitor.events());
  let states = events.forward_states(monitor);
  events.read_stdin();

  println!(
    "Watching connectivity, probing every {}s. Type 'help' for commands.",
    interval.as_secs()
  );

  while let Some(event) = events.next().await {
    match event {
      Event::State(state) => println!("[{}] {}", state, state.description()),
      Event::Connectivity(ConnectivityEvent::ServerReconnected) => {
        println!("Server is reachable again")
      }
      Event::Connectivity(ConnectivityEvent::ServerDisconnected) => {
        println!("Server stopped responding")
      }
      Event::Connectivity(ConnectivityEvent::Changed { is_connected }) => {
        tracing::debug!(is_connected, "Connectivity changed");
      }
      Event::InputClosed => break,
      Event::Input(line) => {
        if line.trim().is_empty() {
          continue;
        }
        let Some(command) = commands::resolve(&line) else {
          let suggestions: Vec<&str> = commands::get_suggestions(&line)
            .iter()
            .map(|c| c.name)
            .collect();
          if suggestions.is_empty() {
            println!("Unknown command '{}'", line.trim());
          } else {
            println!("Did you mean: {}", suggestions.join(", "));
          }
          continue;
        };

        match command.action {
          WatchAction::DeviceOnline => {
            monitor.device_online().await;
          }
          WatchAction::DeviceOffline => {
            monitor.device_offline();
          }
          WatchAction::Check => {
            let state = monitor.check_now().await;
            println!("Probe done: {}", state);
          }
          WatchAction::Sync => sync(client).await?,
          WatchAction::Pending => pending(client).await?,
          WatchAction::Status => status(client).await?,
          WatchAction::Help => {
            for cmd in COMMANDS {
              println!("  {:<8} {:<18} {}", cmd.name, cmd.aliases.join(", "), cmd.description);
            }
          }
          WatchAction::Quit => break,
        }
      }
    }
  }

  states.unsubscribe();
  periodic.stop();
  Ok(())
}
