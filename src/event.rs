use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use crate::connectivity::{ConnectionState, ConnectivityEvent, ConnectivityMonitor};

/// Watch-mode events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// A line typed on stdin
  Input(String),
  /// The connection state changed
  State(ConnectionState),
  /// A boundary signal from the monitor
  Connectivity(ConnectivityEvent),
  /// stdin reached end of file
  InputClosed,
}

/// Event handler merging stdin lines with connectivity signals
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Sender for producers outside this module.
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Spawn a task reading stdin line by line.
  pub fn read_stdin(&self) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if tx.send(Event::Input(line)).is_err() {
              break;
            }
          }
          Ok(None) | Err(_) => {
            let _ = tx.send(Event::InputClosed);
            break;
          }
        }
      }
    });
  }

  /// Spawn a task forwarding the monitor's boundary events.
  pub fn forward_connectivity(&self, mut events: broadcast::Receiver<ConnectivityEvent>) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(event) => {
            if tx.send(Event::Connectivity(event)).is_err() {
              break;
            }
          }
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::debug!(skipped, "Connectivity events dropped");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });
  }

  /// Forward state transitions. The returned subscription must be kept.
  pub fn forward_states(&self, monitor: &ConnectivityMonitor) -> crate::connectivity::Subscription {
    let tx = self.tx.clone();
    monitor.subscribe(move |state| {
      let _ = tx.send(Event::State(state));
    })
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
