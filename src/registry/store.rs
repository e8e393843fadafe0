//! On-disk registry files.
//!
//! Three JSON documents live in the state directory: `services.json`,
//! `ports.json` and `dependencies.json`. Every write goes to a temp file that
//! is synced and renamed over the target, so readers only ever see complete
//! documents. A document that fails to parse is moved to `backup/` with a
//! timestamp suffix and treated as absent.

use super::types::{DependenciesFile, PortsFile, ServicesFile};
use crate::error::{Error, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SERVICES_FILE: &str = "services.json";
pub const PORTS_FILE: &str = "ports.json";
pub const DEPENDENCIES_FILE: &str = "dependencies.json";
const BACKUP_DIR: &str = "backup";

/// Result of reading one document.
#[derive(Debug)]
pub enum Loaded<T> {
    Missing,
    Parsed(T),
    /// The file was corrupt and moved to the contained backup path.
    Recovered(PathBuf),
}

impl<T> Loaded<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Loaded::Parsed(v) => Some(v),
            _ => None,
        }
    }

    pub fn backup(&self) -> Option<&Path> {
        match self {
            Loaded::Recovered(p) => Some(p),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryStore {
    dir: PathBuf,
}

impl RegistryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.join(BACKUP_DIR)
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    pub fn save(
        &self,
        services: &ServicesFile,
        ports: &PortsFile,
        dependencies: &DependenciesFile,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        self.write_json(SERVICES_FILE, services)?;
        self.write_json(PORTS_FILE, ports)?;
        self.write_json(DEPENDENCIES_FILE, dependencies)?;
        Ok(())
    }

    pub fn load_services(&self) -> Result<Loaded<ServicesFile>> {
        self.read_json(SERVICES_FILE)
    }

    pub fn load_ports(&self) -> Result<Loaded<PortsFile>> {
        self.read_json(PORTS_FILE)
    }

    pub fn load_dependencies(&self) -> Result<Loaded<DependenciesFile>> {
        self.read_json(DEPENDENCIES_FILE)
    }

    /// Parse every document, backing up the ones that fail.
    /// Returns the backup paths of recovered files.
    pub fn check_integrity(&self) -> Result<Vec<PathBuf>> {
        let mut recovered = Vec::new();
        recovered.extend(self.load_services()?.backup().map(Path::to_path_buf));
        recovered.extend(self.load_ports()?.backup().map(Path::to_path_buf));
        recovered.extend(self.load_dependencies()?.backup().map(Path::to_path_buf));
        Ok(recovered)
    }

    fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let contents = serde_json::to_string_pretty(value)?;
        atomic_write(&self.path(file), &contents)
    }

    fn read_json<T: DeserializeOwned>(&self, file: &str) -> Result<Loaded<T>> {
        let path = self.path(file);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Missing),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&contents) {
            Ok(value) => Ok(Loaded::Parsed(value)),
            Err(parse_err) => {
                let backup = self.backup_corrupt(&path)?;
                let err = Error::RegistryCorruption {
                    path: path.display().to_string(),
                    reason: parse_err.to_string(),
                };
                tracing::warn!(backup = %backup.display(), "{}; moved aside", err);
                Ok(Loaded::Recovered(backup))
            }
        }
    }

    /// Copy a corrupt file into the backup directory, then discard it.
    fn backup_corrupt(&self, path: &Path) -> Result<PathBuf> {
        let backup_dir = self.backup_dir();
        fs::create_dir_all(&backup_dir)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "registry".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let backup = backup_dir.join(format!("{}.{}.corrupt", file_name, stamp));

        fs::copy(path, &backup)?;
        fs::remove_file(path)?;
        Ok(backup)
    }
}

/// Atomic file write using write-then-rename pattern.
/// This prevents file corruption if the process crashes during write.
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let temp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&temp_path)?;

    file.write_all(contents.as_bytes())?;

    // Ensure data is written to disk before rename
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;
    Ok(())
}
