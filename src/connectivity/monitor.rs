//! The connectivity state machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::probe::{LivenessProbe, ProbeOutcome};
use super::state::{ConnectionState, ConnectivityEvent};

/// Hard upper bound on a single liveness probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// How often the server is probed while the device is up.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

type Listener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerStatus {
  /// No probe has completed since the device last came up
  Unknown,
  Reachable,
  Unreachable,
}

#[derive(Debug)]
struct MonitorState {
  device_online: bool,
  server: ServerStatus,
  current: ConnectionState,
  last_known_good: Option<DateTime<Utc>>,
  /// Bumped on every device transition; probe results from an older epoch are dropped
  epoch: u64,
}

impl MonitorState {
  fn derive(&self) -> ConnectionState {
    if !self.device_online {
      return ConnectionState::DeviceOffline;
    }
    match self.server {
      ServerStatus::Unknown => ConnectionState::Reconnecting,
      ServerStatus::Reachable => ConnectionState::Online,
      ServerStatus::Unreachable => ConnectionState::ServerOffline,
    }
  }
}

struct Inner {
  state: Mutex<MonitorState>,
  /// Serialises a state change together with its notification
  transition: Mutex<()>,
  listeners: Mutex<Vec<(u64, Listener)>>,
  next_listener: AtomicU64,
  probe: Arc<dyn LivenessProbe>,
  probe_timeout: Duration,
  events: broadcast::Sender<ConnectivityEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
  pub state: ConnectionState,
  pub device_online: bool,
  /// `None` until a probe completes after the device last came up
  pub server_reachable: Option<bool>,
  /// Time of the last successful probe
  pub last_known_good: Option<DateTime<Utc>>,
}

/// Owner and sole writer of the current [`ConnectionState`].
///
/// Cheap to clone; all clones share one state. Listeners registered with
/// [`subscribe`](Self::subscribe) run synchronously, in registration order,
/// on every transition. They must not call the monitor's signal methods
/// directly; spawn a task instead.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<Inner>,
}

impl ConnectivityMonitor {
  /// Create a monitor using the default probe timeout.
  ///
  /// With the device up the monitor starts in `Reconnecting` until the first
  /// probe settles.
  pub fn new(probe: Arc<dyn LivenessProbe>, device_online: bool) -> Self {
    Self::with_timeout(probe, device_online, DEFAULT_PROBE_TIMEOUT)
  }

  pub fn with_timeout(
    probe: Arc<dyn LivenessProbe>,
    device_online: bool,
    probe_timeout: Duration,
  ) -> Self {
    let (events, _) = broadcast::channel(64);
    let state = MonitorState {
      device_online,
      server: ServerStatus::Unknown,
      current: ConnectionState::DeviceOffline,
      last_known_good: None,
      epoch: 0,
    };
    let current = state.derive();

    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(MonitorState { current, ..state }),
        transition: Mutex::new(()),
        listeners: Mutex::new(Vec::new()),
        next_listener: AtomicU64::new(0),
        probe,
        probe_timeout,
        events,
      }),
    }
  }

  pub fn state(&self) -> ConnectionState {
    lock(&self.inner.state).current
  }

  pub fn snapshot(&self) -> ConnectivitySnapshot {
    let state = lock(&self.inner.state);
    ConnectivitySnapshot {
      state: state.current,
      device_online: state.device_online,
      server_reachable: match state.server {
        ServerStatus::Unknown => None,
        ServerStatus::Reachable => Some(true),
        ServerStatus::Unreachable => Some(false),
      },
      last_known_good: state.last_known_good,
    }
  }

  pub fn is_device_online(&self) -> bool {
    lock(&self.inner.state).device_online
  }

  pub fn last_known_good(&self) -> Option<DateTime<Utc>> {
    lock(&self.inner.state).last_known_good
  }

  /// Receiver for the boundary event stream.
  pub fn events(&self) -> broadcast::Receiver<ConnectivityEvent> {
    self.inner.events.subscribe()
  }

  /// Register a listener. It is invoked once right away with the current
  /// state, then on every transition.
  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(ConnectionState) + Send + Sync + 'static,
  {
    let listener: Listener = Arc::new(listener);
    let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);

    // Holding the transition lock means no transition can slip in between
    // registration and the initial delivery.
    let _serial = lock(&self.inner.transition);
    lock(&self.inner.listeners).push((id, Arc::clone(&listener)));
    let current = lock(&self.inner.state).current;
    listener(current);

    Subscription {
      inner: Arc::downgrade(&self.inner),
      id,
    }
  }

  /// Device reported network down. Takes effect immediately, whatever probe
  /// may still be in flight.
  pub fn device_offline(&self) -> ConnectionState {
    let (state, was_online) = self.apply(|s| {
      let was_online = s.device_online;
      if was_online {
        s.epoch += 1;
      }
      s.device_online = false;
      s.server = ServerStatus::Unknown;
      if was_online {
        let _ = self
          .inner
          .events
          .send(ConnectivityEvent::Changed { is_connected: false });
      }
      was_online
    });

    if was_online {
      info!("Device went offline");
    }
    state
  }

  /// Device reported network up. Enters `Reconnecting` and probes the server.
  ///
  /// When the device was already up this is the same as [`check_now`](Self::check_now).
  pub async fn device_online(&self) -> ConnectionState {
    let (_, transitioned) = self.apply(|s| {
      if s.device_online {
        return false;
      }
      s.device_online = true;
      s.server = ServerStatus::Unknown;
      s.epoch += 1;
      true
    });

    if transitioned {
      info!("Device back online, verifying server reachability");
    }
    self.probe_and_apply().await
  }

  /// Probe the server now. No probe is sent while the device is down.
  pub async fn check_now(&self) -> ConnectionState {
    self.probe_and_apply().await
  }

  /// Probe every `every` while the device is up. Ticks that fall while the
  /// device is down are skipped; device-up probes on its own. A monitor
  /// still in `Reconnecting` is probed straight away.
  pub fn start_periodic(&self, every: Duration) -> PeriodicProbe {
    let monitor = self.clone();

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately
      ticker.tick().await;
      if monitor.state() == ConnectionState::Reconnecting {
        monitor.check_now().await;
      }

      loop {
        ticker.tick().await;
        if monitor.is_device_online() {
          monitor.check_now().await;
        } else {
          trace!("Device offline, skipping periodic probe");
        }
      }
    });

    PeriodicProbe { handle }
  }

  async fn probe_and_apply(&self) -> ConnectionState {
    let epoch = {
      let state = lock(&self.inner.state);
      if !state.device_online {
        return state.current;
      }
      state.epoch
    };

    let check = tokio::time::timeout(self.inner.probe_timeout, self.inner.probe.check());
    let outcome = match check.await {
      Ok(outcome) => outcome,
      Err(_) => ProbeOutcome::Unreachable(format!(
        "no answer within {}ms",
        self.inner.probe_timeout.as_millis()
      )),
    };
    if let ProbeOutcome::Unreachable(reason) = &outcome {
      debug!(reason = %reason, "Liveness probe failed");
    }
    let reachable = outcome.is_reachable();

    let (state, applied) = self.apply(|s| {
      if !s.device_online || s.epoch != epoch {
        return false;
      }

      let previous = s.server;
      if reachable {
        s.server = ServerStatus::Reachable;
        s.last_known_good = Some(Utc::now());
      } else {
        s.server = ServerStatus::Unreachable;
      }

      let events = &self.inner.events;
      let _ = events.send(ConnectivityEvent::Changed {
        is_connected: reachable,
      });
      match (previous, s.server) {
        (ServerStatus::Unreachable, ServerStatus::Reachable) => {
          let _ = events.send(ConnectivityEvent::ServerReconnected);
        }
        (ServerStatus::Reachable, ServerStatus::Unreachable) => {
          let _ = events.send(ConnectivityEvent::ServerDisconnected);
        }
        _ => {}
      }
      true
    });

    if !applied {
      debug!("Discarding probe result, device state moved on while it was in flight");
    }
    state
  }

  /// Mutate the state, re-derive it and notify listeners if it changed.
  fn apply<R>(&self, update: impl FnOnce(&mut MonitorState) -> R) -> (ConnectionState, R) {
    let _serial = lock(&self.inner.transition);

    let (previous, next, result) = {
      let mut state = lock(&self.inner.state);
      let previous = state.current;
      let result = update(&mut state);
      state.current = state.derive();
      (previous, state.current, result)
    };

    if previous != next {
      info!(from = %previous, to = %next, "Connection state changed");
      let listeners: Vec<Listener> = lock(&self.inner.listeners)
        .iter()
        .map(|(_, listener)| Arc::clone(listener))
        .collect();
      for listener in listeners {
        listener(next);
      }
    }

    (next, result)
  }
}

/// Handle returned by [`ConnectivityMonitor::subscribe`].
pub struct Subscription {
  inner: Weak<Inner>,
  id: u64,
}

impl Subscription {
  /// Stop receiving transitions.
  pub fn unsubscribe(self) {
    if let Some(inner) = self.inner.upgrade() {
      lock(&inner.listeners).retain(|(id, _)| *id != self.id);
    }
  }
}

/// Background periodic probing; stops when dropped.
pub struct PeriodicProbe {
  handle: JoinHandle<()>,
}

impl PeriodicProbe {
  pub fn stop(self) {}
}

impl Drop for PeriodicProbe {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{DelayedProbe, GatedProbe, StaticProbe};

  fn recorder() -> (
    Arc<Mutex<Vec<ConnectionState>>>,
    impl Fn(ConnectionState) + Send + Sync + 'static,
  ) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |state| sink.lock().unwrap().push(state))
  }

  #[tokio::test]
  async fn test_starts_reconnecting_until_first_probe() {
    let probe = StaticProbe::new(true);
    let monitor = ConnectivityMonitor::new(probe.clone(), true);
    assert_eq!(monitor.state(), ConnectionState::Reconnecting);
    assert!(monitor.last_known_good().is_none());

    assert_eq!(monitor.check_now().await, ConnectionState::Online);
    assert!(monitor.last_known_good().is_some());
    assert_eq!(monitor.snapshot().server_reachable, Some(true));
  }

  #[tokio::test]
  async fn test_failed_probe_means_server_offline() {
    let monitor = ConnectivityMonitor::new(StaticProbe::new(false), true);
    assert_eq!(monitor.check_now().await, ConnectionState::ServerOffline);
    assert!(monitor.last_known_good().is_none());
  }

  #[tokio::test]
  async fn test_device_offline_overrides_server_signal() {
    let probe = StaticProbe::new(true);
    let monitor = ConnectivityMonitor::new(probe.clone(), true);
    monitor.check_now().await;

    assert_eq!(monitor.device_offline(), ConnectionState::DeviceOffline);
    // No probes while the device is down
    assert_eq!(monitor.check_now().await, ConnectionState::DeviceOffline);
    assert_eq!(probe.calls(), 1);
  }

  #[tokio::test]
  async fn test_device_online_passes_through_reconnecting() {
    let monitor = ConnectivityMonitor::new(StaticProbe::new(true), false);
    let (seen, listener) = recorder();
    let _subscription = monitor.subscribe(listener);

    assert_eq!(monitor.device_online().await, ConnectionState::Online);
    assert_eq!(
      *seen.lock().unwrap(),
      vec![
        ConnectionState::DeviceOffline,
        ConnectionState::Reconnecting,
        ConnectionState::Online,
      ]
    );
  }

  #[tokio::test]
  async fn test_device_offline_mid_probe_wins() {
    let probe = GatedProbe::new(true);
    let monitor = ConnectivityMonitor::new(probe.clone(), false);

    let reconnect = tokio::spawn({
      let monitor = monitor.clone();
      async move { monitor.device_online().await }
    });

    probe.entered().await;
    assert_eq!(monitor.state(), ConnectionState::Reconnecting);
    monitor.device_offline();
    probe.release();

    assert_eq!(reconnect.await.unwrap(), ConnectionState::DeviceOffline);
    assert_eq!(monitor.state(), ConnectionState::DeviceOffline);
    assert!(monitor.last_known_good().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_probe_timeout_counts_as_unreachable() {
    let monitor = ConnectivityMonitor::new(DelayedProbe::new(Duration::from_secs(10), true), true);

    let started = tokio::time::Instant::now();
    assert_eq!(monitor.check_now().await, ConnectionState::ServerOffline);

    let elapsed = started.elapsed();
    assert!(elapsed >= DEFAULT_PROBE_TIMEOUT);
    assert!(elapsed < Duration::from_secs(10));
  }

  #[tokio::test]
  async fn test_subscribers_called_in_order_with_initial_state() {
    let monitor = ConnectivityMonitor::new(StaticProbe::new(true), true);
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = Arc::clone(&order);
    let _a = monitor.subscribe(move |state| first.lock().unwrap().push((1, state)));
    let second = Arc::clone(&order);
    let _b = monitor.subscribe(move |state| second.lock().unwrap().push((2, state)));

    monitor.check_now().await;

    assert_eq!(
      *order.lock().unwrap(),
      vec![
        (1, ConnectionState::Reconnecting),
        (2, ConnectionState::Reconnecting),
        (1, ConnectionState::Online),
        (2, ConnectionState::Online),
      ]
    );
  }

  #[tokio::test]
  async fn test_no_notification_without_change() {
    let monitor = ConnectivityMonitor::new(StaticProbe::new(true), true);
    monitor.check_now().await;

    let (seen, listener) = recorder();
    let _subscription = monitor.subscribe(listener);
    monitor.check_now().await;

    assert_eq!(*seen.lock().unwrap(), vec![ConnectionState::Online]);
  }

  #[tokio::test]
  async fn test_unsubscribe_stops_delivery() {
    let monitor = ConnectivityMonitor::new(StaticProbe::new(true), true);
    let (seen, listener) = recorder();
    let subscription = monitor.subscribe(listener);

    subscription.unsubscribe();
    monitor.check_now().await;

    assert_eq!(*seen.lock().unwrap(), vec![ConnectionState::Reconnecting]);
  }

  #[tokio::test]
  async fn test_boundary_events() {
    let probe = StaticProbe::new(false);
    let monitor = ConnectivityMonitor::new(probe.clone(), true);
    let mut events = monitor.events();

    monitor.check_now().await;
    probe.set_reachable(true);
    monitor.check_now().await;
    probe.set_reachable(false);
    monitor.check_now().await;
    monitor.device_offline();

    let received: Vec<ConnectivityEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert_eq!(
      received,
      vec![
        ConnectivityEvent::Changed {
          is_connected: false
        },
        ConnectivityEvent::Changed { is_connected: true },
        ConnectivityEvent::ServerReconnected,
        ConnectivityEvent::Changed {
          is_connected: false
        },
        ConnectivityEvent::ServerDisconnected,
        ConnectivityEvent::Changed {
          is_connected: false
        },
      ]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_periodic_probes_pause_while_device_down() {
    let probe = StaticProbe::new(true);
    let monitor = ConnectivityMonitor::new(probe.clone(), true);
    let periodic = monitor.start_periodic(DEFAULT_PROBE_INTERVAL);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(probe.calls(), 2);
    assert_eq!(monitor.state(), ConnectionState::Online);

    monitor.device_offline();
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(probe.calls(), 2);

    monitor.device_online().await;
    assert_eq!(probe.calls(), 3);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(probe.calls(), 4);

    periodic.stop();
  }

  #[tokio::test(start_paused = true)]
  async fn test_periodic_settles_initial_reconnecting_at_once() {
    let probe = StaticProbe::new(true);
    let monitor = ConnectivityMonitor::new(probe.clone(), true);
    assert_eq!(monitor.state(), ConnectionState::Reconnecting);
    let periodic = monitor.start_periodic(DEFAULT_PROBE_INTERVAL);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(monitor.state(), ConnectionState::Online);
    assert_eq!(probe.calls(), 1);

    periodic.stop();
  }

  #[tokio::test(start_paused = true)]
  async fn test_periodic_leaves_settled_state_to_the_interval() {
    let probe = StaticProbe::new(false);
    let monitor = ConnectivityMonitor::new(probe.clone(), true);
    monitor.check_now().await;
    let periodic = monitor.start_periodic(DEFAULT_PROBE_INTERVAL);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(probe.calls(), 1);
    assert_eq!(monitor.state(), ConnectionState::ServerOffline);

    periodic.stop();
  }
}
