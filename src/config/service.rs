//! Per-service configuration.
//!
//! A [`ServiceConfig`] is the opaque launch boundary: argv, environment and
//! working directory, plus the networking and health metadata the
//! orchestrator needs to register and probe the service.

use crate::port::PortRange;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Coarse service category. Selects the extended fallback port range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceClass {
    Frontend,
    Backend,
    Auth,
    Infrastructure,
    #[default]
    Other,
}

impl fmt::Display for ServiceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceClass::Frontend => "frontend",
            ServiceClass::Backend => "backend",
            ServiceClass::Auth => "auth",
            ServiceClass::Infrastructure => "infrastructure",
            ServiceClass::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// argv list; the first element is the program.
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    #[serde(default)]
    pub class: ServiceClass,

    /// Preferred port. Kept as u32 so out-of-range values reach validation
    /// instead of failing inside serde with a less useful message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range: Option<[u32; 2]>,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Replaces the recovery-wide fatal marker list for this service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_markers: Option<Vec<String>>,

    /// Files removed by the recovery attempt stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub temp_files: Vec<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl ServiceConfig {
    /// Minimal config running `command`, mostly useful in tests.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            cwd: None,
            class: ServiceClass::default(),
            port: None,
            port_range: None,
            host: default_host(),
            protocol: default_protocol(),
            health_path: default_health_path(),
            depends_on: Vec::new(),
            fatal_markers: None,
            temp_files: Vec::new(),
        }
    }

    pub fn preferred_port(&self) -> Option<u16> {
        self.port.and_then(|p| u16::try_from(p).ok()).filter(|p| *p != 0)
    }

    pub fn range(&self) -> Result<Option<PortRange>> {
        self.port_range
            .map(|[start, end]| PortRange::new(start, end))
            .transpose()
    }

    /// Build the launch command for this service, resolving `cwd` against `workdir`.
    pub fn start_command(&self, workdir: &Path) -> Result<StartCommand> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| Error::Validation("command must not be empty".to_string()))?;

        let cwd = match &self.cwd {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => workdir.join(dir),
            None => workdir.to_path_buf(),
        };

        Ok(StartCommand {
            program: program.clone(),
            args: args.to_vec(),
            env: self.env.clone(),
            cwd,
        })
    }
}

/// Opaque launch description handed to the process supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

impl StartCommand {
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}
