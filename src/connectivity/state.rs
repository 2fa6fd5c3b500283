use std::fmt;

/// Unified connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
  /// Device online, server reachable
  Online,
  /// Device has no network connection
  DeviceOffline,
  /// Device has a connection but the server is unreachable
  ServerOffline,
  /// Device just came back; waiting on the liveness probe
  Reconnecting,
}

impl ConnectionState {
  pub fn is_online(self) -> bool {
    self == ConnectionState::Online
  }

  /// Why requests cannot be expected to reach the server, if they can't.
  pub fn offline_reason(self) -> Option<OfflineReason> {
    match self {
      ConnectionState::Online => None,
      ConnectionState::DeviceOffline => Some(OfflineReason::Device),
      ConnectionState::ServerOffline | ConnectionState::Reconnecting => Some(OfflineReason::Server),
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ConnectionState::Online => "online",
      ConnectionState::DeviceOffline => "device_offline",
      ConnectionState::ServerOffline => "server_offline",
      ConnectionState::Reconnecting => "reconnecting",
    }
  }

  /// Status indicator text for the UI.
  pub fn description(self) -> &'static str {
    match self {
      ConnectionState::Online => "Connected. All functions available.",
      ConnectionState::DeviceOffline => "You're offline. Limited functionality available.",
      ConnectionState::ServerOffline => "Server connection lost. Limited functionality available.",
      ConnectionState::Reconnecting => "Reconnecting to the server...",
    }
  }
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Which side of the connection is at fault.
///
/// The remedy differs (reconnect the device vs. wait for the service), so
/// every offline message the user sees names one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OfflineReason {
  Device,
  Server,
}

impl OfflineReason {
  pub fn message(self) -> &'static str {
    match self {
      OfflineReason::Device => "You are offline",
      OfflineReason::Server => "The server is currently unavailable",
    }
  }

  /// Message attached to a write accepted into the replay queue.
  pub fn queued_message(self) -> &'static str {
    match self {
      OfflineReason::Device => {
        "Your submission has been saved and will be submitted when you are back online."
      }
      OfflineReason::Server => {
        "Server is currently unavailable. Your submission has been saved and will be \
         submitted when connectivity is restored."
      }
    }
  }

  /// Message attached to the placeholder returned for uncached API data.
  pub fn uncached_message(self) -> &'static str {
    match self {
      OfflineReason::Device => "You are offline. This data was not found in the cache.",
      OfflineReason::Server => {
        "The server is currently unavailable. This data was not found in the cache."
      }
    }
  }
}

impl fmt::Display for OfflineReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.message())
  }
}

/// Signals published at the boundary towards the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  /// Emitted after every probe and whenever the device drops
  Changed { is_connected: bool },
  /// Server became reachable again after a failed probe
  ServerReconnected,
  /// Server stopped answering after a successful probe
  ServerDisconnected,
}
