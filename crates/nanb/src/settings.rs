//! User settings.
//!
//! Settings are stored as JSON in `settings.json` inside the config directory
//! (`~/.nanb` unless overridden on the command line). Every field has a
//! default, so a partial file (or no file at all) is valid.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Actions a key can be bound to.
pub const KEYBINDING_ACTIONS: &[&str] = &[
    "quit",
    "restart_kernel",
    "copy",
    "clear_cell_output",
    "interrupt",
];

fn default_keybindings() -> BTreeMap<String, String> {
    [
        ("quit", "q"),
        ("restart_kernel", "ctrl+r"),
        ("copy", "y"),
        ("clear_cell_output", "c"),
        ("interrupt", "i"),
    ]
    .into_iter()
    .map(|(action, key)| (action.to_string(), key.to_string()))
    .collect()
}

/// Where the kernel logs and listens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Kernel stdout/stderr are appended here.
    pub log_file: PathBuf,
    /// Socket paths are `<socket_prefix><uuid>`.
    pub socket_prefix: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("/tmp/nanb_server.log"),
            socket_prefix: "/tmp/nanb_socket_".to_string(),
        }
    }
}

/// Kernel process and timing settings. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSettings {
    /// Interpreter command, program first.
    pub interpreter: Vec<String>,
    /// Explicit path to the `nanb-kernel` binary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_binary: Option<PathBuf>,
    pub spawn_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// How long the session waits for an interrupted run to resolve.
    pub interrupt_timeout_ms: u64,
    /// How long the kernel waits for the interpreter to honour SIGINT
    /// before replacing it. Must be shorter than `interrupt_timeout_ms`.
    pub interrupt_grace_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string()],
            kernel_binary: None,
            spawn_timeout_ms: 10_000,
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 10_000,
            interrupt_timeout_ms: 5_000,
            interrupt_grace_ms: 2_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl KernelSettings {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    /// Labels longer than this are truncated for display.
    pub cell_name_max: usize,
    /// Action name to key.
    pub keybindings: BTreeMap<String, String>,
    pub kernel: KernelSettings,
    /// Keep going after a failed cell in `run_all`.
    pub continue_on_error: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            cell_name_max: 20,
            keybindings: default_keybindings(),
            kernel: KernelSettings::default(),
            continue_on_error: false,
        }
    }
}

impl Settings {
    /// Path of the settings file inside `config_dir`.
    pub fn path(config_dir: &Path) -> PathBuf {
        config_dir.join(SETTINGS_FILE_NAME)
    }

    /// Load settings from `config_dir`, returning defaults if the file
    /// doesn't exist.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = Self::path(config_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::Settings(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text).map_err(|e| match e {
            Error::Settings(msg) => Error::Settings(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Parse and validate settings JSON.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut settings: Settings =
            serde_json::from_str(text).map_err(|e| Error::Settings(e.to_string()))?;

        // Bindings in the file override defaults one action at a time.
        let mut keybindings = default_keybindings();
        for (action, key) in std::mem::take(&mut settings.keybindings) {
            if !KEYBINDING_ACTIONS.contains(&action.as_str()) {
                return Err(Error::Settings(format!("unsupported keybinding: {}", action)));
            }
            keybindings.insert(action, key);
        }
        settings.keybindings = keybindings;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.kernel.interpreter.is_empty() {
            return Err(Error::Settings("kernel.interpreter is empty".to_string()));
        }
        if self.kernel.heartbeat_interval_ms == 0 {
            return Err(Error::Settings(
                "kernel.heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.kernel.heartbeat_timeout_ms <= self.kernel.heartbeat_interval_ms {
            return Err(Error::Settings(
                "kernel.heartbeat_timeout_ms must exceed kernel.heartbeat_interval_ms".to_string(),
            ));
        }
        if self.kernel.interrupt_timeout_ms <= self.kernel.interrupt_grace_ms {
            return Err(Error::Settings(
                "kernel.interrupt_timeout_ms must exceed kernel.interrupt_grace_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Write settings to `config_dir`, creating the directory if needed.
    pub fn save(&self, config_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(config_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(config_dir), json)?;
        Ok(())
    }

    /// Interpreter program and its extra arguments.
    pub fn interpreter(&self) -> (&str, &[String]) {
        match self.kernel.interpreter.split_first() {
            Some((program, args)) => (program.as_str(), args),
            None => ("python3", &[]),
        }
    }
}
