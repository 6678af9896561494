//! Driver registry: name to in-process driver or external executable.
//!
//! External drivers are found by [`DriverRegistry::discover`] and started on
//! first use by [`DriverRegistry::get`]. A started driver is reused until
//! its session drops.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::driver::external::{ExternalDriver, ExternalDriverConfig, SpawnError};
use crate::driver::Driver;

/// File-name prefix of driver executables.
pub const DRIVER_PREFIX: &str = "drivelet-driver-";

/// Environment variable listing extra driver directories or files.
pub const DRIVERS_PATH_ENV: &str = "DRIVELET_DRIVERS_PATH";

const EXTERNAL_SUFFIX: &str = " (external)";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("driver {0} is not registered")]
    NotFound(String),

    #[error("failed to start driver {name}: {source}")]
    Start {
        name: String,
        #[source]
        source: SpawnError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Internal,
    External,
}

/// Where to look for driver executables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Standard install directory, scanned when it exists.
    pub standard_dir: Option<PathBuf>,
    /// Extra entries: directories are scanned, files registered directly.
    pub search_path: Vec<PathBuf>,
}

impl DiscoveryConfig {
    /// `<exe dir>/../libexec/drivelet/drivers` plus `DRIVELET_DRIVERS_PATH`.
    pub fn from_env() -> Self {
        let standard_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().and_then(Path::parent).map(Path::to_path_buf))
            .map(|prefix| prefix.join("libexec").join("drivelet").join("drivers"));
        Self {
            standard_dir,
            search_path: parse_search_path(std::env::var_os(DRIVERS_PATH_ENV)),
        }
    }

    pub fn with_standard_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.standard_dir = Some(dir.into());
        self
    }

    pub fn with_search_path(mut self, path: Vec<PathBuf>) -> Self {
        self.search_path = path;
        self
    }
}

/// Splits a path list on the platform separator, dropping empty entries.
pub fn parse_search_path(value: Option<OsString>) -> Vec<PathBuf> {
    match value {
        Some(value) => std::env::split_paths(&value)
            .filter(|p| !p.as_os_str().is_empty())
            .collect(),
        None => Vec::new(),
    }
}

/// Driver name encoded in an executable's file name, if it has one.
///
/// `drivelet-driver-qemu` and `drivelet-driver-qemu.exe` both name `qemu`.
pub fn driver_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let name = stem.strip_prefix(DRIVER_PREFIX)?;
    (!name.is_empty()).then(|| name.to_string())
}

#[derive(Default)]
struct Entries {
    internal: HashMap<String, Arc<dyn Driver>>,
    external: HashMap<String, PathBuf>,
    started: HashMap<String, Arc<ExternalDriver>>,
}

/// Explicitly constructed driver registry.
#[derive(Default)]
pub struct DriverRegistry {
    entries: RwLock<Entries>,
    external_config: ExternalDriverConfig,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_external_config(mut self, config: ExternalDriverConfig) -> Self {
        self.external_config = config;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an in-process driver. Returns false (and keeps the
    /// existing entry) if the name is taken.
    pub fn register(&self, name: &str, driver: Arc<dyn Driver>) -> bool {
        let mut entries = self.write();
        if entries.internal.contains_key(name) {
            tracing::debug!(driver = name, "Driver already registered, skipping");
            return false;
        }
        entries.internal.insert(name.to_string(), driver);
        true
    }

    /// Registers a driver executable. Returns false (and keeps the
    /// existing entry) if the name is taken.
    pub fn register_external(&self, name: &str, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        let mut entries = self.write();
        if entries.external.contains_key(name) {
            tracing::debug!(driver = name, path = %path.display(), "Driver already registered, skipping");
            return false;
        }
        tracing::debug!(driver = name, path = %path.display(), "Registered external driver");
        entries.external.insert(name.to_string(), path);
        true
    }

    /// Sorted names; external drivers carry an ` (external)` suffix.
    pub fn list(&self) -> Vec<String> {
        let entries = self.read();
        let mut names: Vec<String> = entries
            .internal
            .keys()
            .cloned()
            .chain(
                entries
                    .external
                    .keys()
                    .map(|name| format!("{name}{EXTERNAL_SUFFIX}")),
            )
            .collect();
        names.sort();
        names
    }

    /// Internal drivers take precedence over external ones of the same name.
    pub fn kind(&self, name: &str) -> Option<DriverKind> {
        let entries = self.read();
        if entries.internal.contains_key(name) {
            Some(DriverKind::Internal)
        } else if entries.external.contains_key(name) {
            Some(DriverKind::External)
        } else {
            None
        }
    }

    pub fn external_path(&self, name: &str) -> Option<PathBuf> {
        self.read().external.get(name).cloned()
    }

    /// Returns the driver, starting an external driver if needed.
    pub async fn get(&self, name: &str) -> Result<Arc<dyn Driver>, RegistryError> {
        let internal = self.read().internal.get(name).cloned();
        if let Some(driver) = internal {
            return Ok(driver);
        }
        let started = self.start_external(name).await?;
        Ok(started)
    }

    /// Starts (or reuses) the external driver registered under `name`.
    pub async fn start_external(&self, name: &str) -> Result<Arc<ExternalDriver>, RegistryError> {
        let path = {
            let entries = self.read();
            if let Some(running) = entries.started.get(name)
                && running.is_connected()
            {
                tracing::debug!(driver = name, "Reusing running external driver");
                return Ok(Arc::clone(running));
            }
            entries
                .external
                .get(name)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?
        };

        let driver = ExternalDriver::start(name, &path, self.external_config.clone())
            .await
            .map_err(|source| RegistryError::Start {
                name: name.to_string(),
                source,
            })?;
        let driver = Arc::new(driver);

        let mut entries = self.write();
        if let Some(running) = entries.started.get(name)
            && running.is_connected()
        {
            // Lost a race with a concurrent start; ours is killed on drop.
            return Ok(Arc::clone(running));
        }
        entries.started.insert(name.to_string(), Arc::clone(&driver));
        Ok(driver)
    }

    /// Stops every external driver this registry started.
    pub async fn shutdown(&self) {
        let started: Vec<Arc<ExternalDriver>> = {
            let mut entries = self.write();
            entries.started.drain().map(|(_, driver)| driver).collect()
        };
        let stops = started.iter().map(|driver| async move {
            match driver.stop().await {
                Ok(status) => tracing::debug!(driver = driver.name(), %status, "External driver stopped"),
                Err(e) => tracing::warn!(driver = driver.name(), error = %e, "Stopping external driver failed"),
            }
        });
        futures::future::join_all(stops).await;
    }

    /// Registers every driver executable found per `config`. Unreadable
    /// entries are logged and skipped.
    pub fn discover(&self, config: &DiscoveryConfig) {
        if let Some(dir) = &config.standard_dir
            && dir.is_dir()
        {
            self.discover_dir(dir);
        }

        for entry in &config.search_path {
            let metadata = match fs::metadata(entry) {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!(path = %entry.display(), error = %e, "Error accessing driver path");
                    continue;
                }
            };
            if metadata.is_dir() {
                self.discover_dir(entry);
            } else if is_executable(&metadata) {
                self.register_file(entry);
            }
        }
    }

    fn discover_dir(&self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Error reading driver directory");
                return;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Error reading driver directory entry");
                    continue;
                }
            };
            let path = entry.path();
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to stat driver candidate");
                    continue;
                }
            };
            if metadata.is_dir() || !is_executable(&metadata) {
                continue;
            }
            self.register_file(&path);
        }
    }

    fn register_file(&self, path: &Path) {
        match driver_name(path) {
            Some(name) => {
                self.register_external(&name, path);
            }
            None => {
                tracing::debug!(
                    path = %path.display(),
                    "Skipping file without {DRIVER_PREFIX} prefix"
                );
            }
        }
    }
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(metadata: &fs::Metadata) -> bool {
    metadata.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::NullDriver;

    #[cfg(unix)]
    fn touch(dir: &Path, name: &str, mode: u32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn driver_name_from_file_name() {
        assert_eq!(
            driver_name(Path::new("/opt/drivelet-driver-qemu")).as_deref(),
            Some("qemu")
        );
        assert_eq!(
            driver_name(Path::new("drivelet-driver-vz.exe")).as_deref(),
            Some("vz")
        );
        assert_eq!(driver_name(Path::new("/opt/qemu")), None);
        assert_eq!(driver_name(Path::new("drivelet-driver-")), None);
    }

    #[test]
    fn search_path_skips_empty_entries() {
        let joined = std::env::join_paths(["/a", "", "/b"]).unwrap();
        assert_eq!(
            parse_search_path(Some(joined)),
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
        assert!(parse_search_path(None).is_empty());
    }

    #[test]
    fn register_ignores_duplicates_and_lists_sorted() {
        let registry = DriverRegistry::new();
        assert!(registry.register("vz", Arc::new(NullDriver::new())));
        assert!(!registry.register("vz", Arc::new(NullDriver::new())));
        assert!(registry.register_external("qemu", "/opt/drivelet-driver-qemu"));
        assert!(!registry.register_external("qemu", "/elsewhere"));

        assert_eq!(registry.list(), vec!["qemu (external)", "vz"]);
        assert_eq!(registry.kind("vz"), Some(DriverKind::Internal));
        assert_eq!(registry.kind("qemu"), Some(DriverKind::External));
        assert_eq!(registry.kind("wsl2"), None);
        assert_eq!(
            registry.external_path("qemu"),
            Some(PathBuf::from("/opt/drivelet-driver-qemu"))
        );
    }

    #[tokio::test]
    async fn get_returns_internal_driver() {
        let registry = DriverRegistry::new();
        registry.register("null", Arc::new(NullDriver::new()));
        let driver = registry.get("null").await.unwrap();
        assert_eq!(driver.info().await.unwrap().name, "null");

        assert!(matches!(
            registry.get("missing").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn discover_scans_dirs_and_files() {
        let standard = tempfile::tempdir().unwrap();
        touch(standard.path(), "drivelet-driver-qemu", 0o755);
        touch(standard.path(), "drivelet-driver-noexec", 0o644);
        touch(standard.path(), "unrelated-tool", 0o755);
        fs::create_dir(standard.path().join("drivelet-driver-dir")).unwrap();

        let extra = tempfile::tempdir().unwrap();
        touch(extra.path(), "drivelet-driver-vz.sh", 0o755);
        let single = touch(extra.path(), "drivelet-driver-krunkit", 0o700);

        let config = DiscoveryConfig::default()
            .with_standard_dir(standard.path())
            .with_search_path(vec![
                extra.path().to_path_buf(),
                single.clone(),
                PathBuf::from("/nonexistent/drivelet"),
            ]);

        let registry = DriverRegistry::new();
        registry.discover(&config);

        assert_eq!(
            registry.list(),
            vec!["krunkit (external)", "qemu (external)", "vz (external)"]
        );
        assert_eq!(registry.external_path("krunkit"), Some(single));
        assert_eq!(
            registry.external_path("vz"),
            Some(extra.path().join("drivelet-driver-vz.sh"))
        );
    }

    #[test]
    fn discover_tolerates_missing_standard_dir() {
        let config = DiscoveryConfig::default().with_standard_dir("/nonexistent/libexec/drivelet");
        let registry = DriverRegistry::new();
        registry.discover(&config);
        assert!(registry.list().is_empty());
    }
}
