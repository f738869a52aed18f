//! Daemon configuration.
//!
//! Parsing a configuration file is the frontend's job; the core consumes
//! the finished [`Config`] struct. [`Config::default`] matches the
//! defaults the daemon ships with.

use std::path::PathBuf;
use std::time::Duration;

/// What to do when a power key or switch fires, or when the idle timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleAction {
    /// Do nothing
    Ignore,
    /// Power the machine off
    Poweroff,
    /// Reboot the machine
    Reboot,
    /// Halt the machine without powering it off
    Halt,
    /// Suspend to RAM
    Suspend,
    /// Suspend to disk
    Hibernate,
    /// Suspend to both RAM and disk
    HybridSleep,
    /// Lock all sessions
    Lock,
}

impl HandleAction {
    /// The configuration-file spelling of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleAction::Ignore => "ignore",
            HandleAction::Poweroff => "poweroff",
            HandleAction::Reboot => "reboot",
            HandleAction::Halt => "halt",
            HandleAction::Suspend => "suspend",
            HandleAction::Hibernate => "hibernate",
            HandleAction::HybridSleep => "hybrid-sleep",
            HandleAction::Lock => "lock",
        }
    }

    /// Parses the configuration-file spelling.
    pub fn from_str(s: &str) -> Option<HandleAction> {
        Some(match s {
            "ignore" => HandleAction::Ignore,
            "poweroff" => HandleAction::Poweroff,
            "reboot" => HandleAction::Reboot,
            "halt" => HandleAction::Halt,
            "suspend" => HandleAction::Suspend,
            "hibernate" => HandleAction::Hibernate,
            "hybrid-sleep" => HandleAction::HybridSleep,
            "lock" => HandleAction::Lock,
            _ => return None,
        })
    }
}

impl std::fmt::Display for HandleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime configuration of the daemon core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Master switch for killing a user's leftover processes at logout.
    pub kill_user_processes: bool,
    /// If non-empty, only these users are subject to the logout kill.
    pub kill_only_users: Vec<String>,
    /// Users that are never subject to the logout kill.
    pub kill_exclude_users: Vec<String>,
    /// Upper bound a delay inhibitor may stall a power operation.
    pub inhibit_delay_max: Duration,
    /// Action bound to the power key.
    pub handle_power_key: HandleAction,
    /// Action bound to the suspend key.
    pub handle_suspend_key: HandleAction,
    /// Action bound to the hibernate key.
    pub handle_hibernate_key: HandleAction,
    /// Action bound to closing the lid.
    pub handle_lid_switch: HandleAction,
    /// Lid action while docked or driving multiple displays.
    pub handle_lid_switch_docked: HandleAction,
    /// Action taken once the idle hint has been stable for `idle_action_sec`.
    pub idle_action: HandleAction,
    /// How long the idle hint must hold before `idle_action` fires.
    pub idle_action_sec: Duration,
    /// Grace period after boot, resume or a power-key action before the
    /// next key or switch is honored again.
    pub holdoff_timeout_sec: Duration,
    /// Strings tried for `/sys/power/disk` when suspending.
    pub suspend_mode: Vec<String>,
    /// Strings tried for `/sys/power/state` when suspending.
    pub suspend_state: Vec<String>,
    /// Strings tried for `/sys/power/disk` when hibernating.
    pub hibernate_mode: Vec<String>,
    /// Strings tried for `/sys/power/state` when hibernating.
    pub hibernate_state: Vec<String>,
    /// Strings tried for `/sys/power/disk` for hybrid sleep.
    pub hybrid_sleep_mode: Vec<String>,
    /// Strings tried for `/sys/power/state` for hybrid sleep.
    pub hybrid_sleep_state: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            kill_user_processes: false,
            kill_only_users: Vec::new(),
            kill_exclude_users: Vec::new(),
            inhibit_delay_max: Duration::from_secs(5),
            handle_power_key: HandleAction::Poweroff,
            handle_suspend_key: HandleAction::Suspend,
            handle_hibernate_key: HandleAction::Hibernate,
            handle_lid_switch: HandleAction::Suspend,
            handle_lid_switch_docked: HandleAction::Ignore,
            idle_action: HandleAction::Ignore,
            idle_action_sec: Duration::from_secs(30 * 60),
            holdoff_timeout_sec: Duration::from_secs(30),
            suspend_mode: Vec::new(),
            suspend_state: strings(&["mem", "standby", "freeze"]),
            hibernate_mode: strings(&["platform", "shutdown"]),
            hibernate_state: strings(&["disk"]),
            hybrid_sleep_mode: strings(&["suspend", "platform", "shutdown"]),
            hybrid_sleep_state: strings(&["disk"]),
        }
    }
}

/// Filesystem locations the manager reads and writes.
///
/// Kept separate from [`Config`] so tests can redirect everything into a
/// scratch directory.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Runtime directory holding session, user and inhibitor state files.
    pub runtime_dir: PathBuf,
    /// Directory seat-assignment udev rules are written to.
    pub rules_dir: PathBuf,
    /// Directory holding per-user linger markers.
    pub linger_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Paths {
            runtime_dir: PathBuf::from("/run/sessiond"),
            rules_dir: PathBuf::from("/etc/udev/rules.d"),
            linger_dir: PathBuf::from("/var/lib/sessiond/linger"),
        }
    }
}

impl Paths {
    /// Directory of per-session state files.
    pub fn sessions_dir(&self) -> PathBuf {
        self.runtime_dir.join("sessions")
    }

    /// Directory of per-user state files.
    pub fn users_dir(&self) -> PathBuf {
        self.runtime_dir.join("users")
    }

    /// Directory of inhibitor state files and their fifos.
    pub fn inhibit_dir(&self) -> PathBuf {
        self.runtime_dir.join("inhibit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_configuration() {
        let config = Config::default();
        assert!(!config.kill_user_processes);
        assert_eq!(config.inhibit_delay_max, Duration::from_secs(5));
        assert_eq!(config.handle_power_key, HandleAction::Poweroff);
        assert_eq!(config.handle_lid_switch, HandleAction::Suspend);
        assert_eq!(config.handle_lid_switch_docked, HandleAction::Ignore);
        assert_eq!(config.suspend_state, vec!["mem", "standby", "freeze"]);
        assert_eq!(config.hibernate_state, vec!["disk"]);
        assert!(config.suspend_mode.is_empty());
    }

    #[test]
    fn handle_action_round_trip() {
        for action in [
            HandleAction::Ignore,
            HandleAction::Poweroff,
            HandleAction::Reboot,
            HandleAction::Halt,
            HandleAction::Suspend,
            HandleAction::Hibernate,
            HandleAction::HybridSleep,
            HandleAction::Lock,
        ] {
            assert_eq!(HandleAction::from_str(action.as_str()), Some(action));
        }
        assert_eq!(HandleAction::from_str("kexec"), None);
    }
}
