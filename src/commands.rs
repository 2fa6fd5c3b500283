//! Watch-mode commands and matching logic

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
  DeviceOnline,
  DeviceOffline,
  Check,
  Sync,
  Pending,
  Status,
  Help,
  Quit,
}

#[derive(Debug, Clone)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
  pub action: Action,
}

/// All available commands
pub const COMMANDS: &[Command] = &[
  Command {
    name: "online",
    aliases: &["up", "on"],
    description: "Report the device network as up",
    action: Action::DeviceOnline,
  },
  Command {
    name: "offline",
    aliases: &["down", "off"],
    description: "Report the device network as down",
    action: Action::DeviceOffline,
  },
  Command {
    name: "check",
    aliases: &["c", "ping", "probe"],
    description: "Probe the server now",
    action: Action::Check,
  },
  Command {
    name: "sync",
    aliases: &["s", "replay"],
    description: "Replay queued writes",
    action: Action::Sync,
  },
  Command {
    name: "pending",
    aliases: &["p", "queue"],
    description: "List queued writes",
    action: Action::Pending,
  },
  Command {
    name: "status",
    aliases: &["st", "state"],
    description: "Show connection state",
    action: Action::Status,
  },
  Command {
    name: "help",
    aliases: &["h", "?"],
    description: "List commands",
    action: Action::Help,
  },
  Command {
    name: "quit",
    aliases: &["q", "exit"],
    description: "Stop watching",
    action: Action::Quit,
  },
];

fn ranked(input: &str) -> Vec<(&'static Command, u32)> {
  let input_lower = input.trim().to_lowercase();

  if input_lower.is_empty() {
    return COMMANDS.iter().map(|cmd| (cmd, 0)).collect();
  }

  let mut matches: Vec<(&Command, u32)> = Vec::new();

  for cmd in COMMANDS {
    if cmd.name == input_lower {
      matches.push((cmd, 0));
    } else if cmd.aliases.contains(&input_lower.as_str()) {
      matches.push((cmd, 1));
    } else if cmd.name.starts_with(&input_lower) {
      matches.push((cmd, 2));
    } else if cmd.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      matches.push((cmd, 3));
    } else if cmd.name.contains(&input_lower) {
      matches.push((cmd, 4));
    } else if cmd.aliases.iter().any(|a| a.contains(&input_lower)) {
      matches.push((cmd, 5));
    }
  }

  matches.sort_by_key(|(_, priority)| *priority);
  matches
}

/// Suggestions for a partial input, best first
pub fn get_suggestions(input: &str) -> Vec<&'static Command> {
  ranked(input).into_iter().map(|(cmd, _)| cmd).collect()
}

/// The command an input unambiguously names.
///
/// Exact names and aliases always resolve; prefixes resolve only when a
/// single command has the best match. Substring matches never resolve.
pub fn resolve(input: &str) -> Option<&'static Command> {
  if input.trim().is_empty() {
    return None;
  }

  let matches = ranked(input);
  let (best, priority) = *matches.first()?;
  if priority > 3 {
    return None;
  }
  let tied = matches.iter().filter(|(_, p)| *p == priority).count();
  (tied == 1).then_some(best)
}
