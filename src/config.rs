//! Runtime configuration for CLI CSAPs.
//!
//! Loaded from TOML; every field has a default so an empty file (or no file)
//! is a valid configuration.
//!
//! ```toml
//! [cli]
//! read_timeout_secs = 5
//! strip_echo = true
//! debug_log = true
//!
//! [programs]
//! serial = "cu"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::spec::ConnectionKind;

/// Default seconds to wait for a prompt on each expect cycle
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 5;

/// Default limit of unmatched program output kept by the expect engine (64KB)
pub const DEFAULT_MATCH_MAX: usize = 64 * 1024;

/// Default receive buffer used by `send_recv` (64KB)
pub const DEFAULT_RECV_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cli: CliConfig,
    pub programs: ProgramTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    /// Prompt wait per expect cycle, used when the CSAP spec has no
    /// `read-timeout` field
    pub read_timeout_secs: u64,

    /// Unmatched output limit before the engine reports a full buffer
    pub match_max: usize,

    /// Strip the echoed command from `write_read` responses
    pub strip_echo: bool,

    /// Receive buffer size for registry `send_recv`
    pub recv_buffer: usize,

    /// Write a transcript of every session to `debug_dir`
    pub debug_log: bool,

    /// Transcript directory (system temp dir when unset)
    pub debug_dir: Option<PathBuf>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            match_max: DEFAULT_MATCH_MAX,
            strip_echo: true,
            recv_buffer: DEFAULT_RECV_BUFFER,
            debug_log: false,
            debug_dir: None,
        }
    }
}

impl CliConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn debug_dir(&self) -> PathBuf {
        self.debug_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Program spawned for each connection kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProgramTable {
    pub serial: String,
    pub telnet: String,
    pub ssh: String,
    pub shell: String,
}

impl Default for ProgramTable {
    fn default() -> Self {
        Self {
            serial: "millicom".to_string(),
            telnet: "telnet".to_string(),
            ssh: "ssh".to_string(),
            shell: "sh".to_string(),
        }
    }
}

impl ProgramTable {
    pub fn program(&self, kind: ConnectionKind) -> &str {
        match kind {
            ConnectionKind::Serial => &self.serial,
            ConnectionKind::Telnet => &self.telnet,
            ConnectionKind::Ssh => &self.ssh,
            ConnectionKind::Shell => &self.shell,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.cli.match_max == 0 {
            return Err(Error::Config("cli.match_max must be positive".to_string()));
        }
        if self.cli.read_timeout_secs == 0 {
            return Err(Error::Config(
                "cli.read_timeout_secs must be positive".to_string(),
            ));
        }
        let table = &self.programs;
        for (name, program) in [
            ("serial", &table.serial),
            ("telnet", &table.telnet),
            ("ssh", &table.ssh),
            ("shell", &table.shell),
        ] {
            if program.is_empty() {
                return Err(Error::Config(format!("programs.{} is empty", name)));
            }
        }
        Ok(())
    }
}
