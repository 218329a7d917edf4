//! Server definitions and the store they are read from
//!
//! The store is a flat set of named records. The supervisor only reads from
//! it; writes happen through whatever tooling registers servers.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Git context captured when the server was registered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitInfo {
    /// Checked-out branch, if any
    #[serde(default)]
    pub branch: Option<String>,
    /// Whether the working directory is a linked worktree
    #[serde(default)]
    pub is_worktree: bool,
}

/// Environment-driven subdomain axes, in declaration order.
///
/// Each entry maps one environment variable to the values it fans out into.
/// JSON objects are read in document order so "first declared" is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSubdomains(Vec<(String, Vec<String>)>);

impl EnvSubdomains {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append an axis (builder pattern)
    pub fn with(mut self, var: impl Into<String>, values: &[&str]) -> Self {
        self.0
            .push((var.into(), values.iter().map(|v| v.to_string()).collect()));
        self
    }

    /// The first declared axis, if any
    pub fn first(&self) -> Option<(&str, &[String])> {
        self.0.first().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for EnvSubdomains {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (var, values) in &self.0 {
            map.serialize_entry(var, values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for EnvSubdomains {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = EnvSubdomains;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of environment variable names to value lists")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut axes = Vec::with_capacity(access.size_hint().unwrap_or(1));
                while let Some((var, values)) = access.next_entry::<String, Vec<String>>()? {
                    axes.push((var, values));
                }
                Ok(EnvSubdomains(axes))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// A named server definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique name, also the base of the server's domain
    pub name: String,
    /// Shell command line used to launch the server
    pub command: String,
    /// Working directory for the command
    pub cwd: PathBuf,
    /// Fixed port; allocated dynamically when absent
    #[serde(default)]
    pub port: Option<u16>,
    /// Environment overrides applied on top of the inherited environment
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Variant fan-out axes
    #[serde(default)]
    pub env_subdomains: Option<EnvSubdomains>,
    #[serde(default)]
    pub git: Option<GitInfo>,
    /// Temporary servers are registered for a single session
    #[serde(default)]
    pub temporary: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ServerConfig {
    /// Create a config with defaults for the optional fields
    pub fn new(name: &str, command: &str, cwd: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            cwd: cwd.into(),
            port: None,
            env: HashMap::new(),
            env_subdomains: None,
            git: None,
            temporary: false,
            created_at: Utc::now(),
        }
    }

    /// Pin the port (builder pattern)
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Add an environment override (builder pattern)
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the variant axes (builder pattern)
    pub fn with_env_subdomains(mut self, axes: EnvSubdomains) -> Self {
        self.env_subdomains = Some(axes);
        self
    }

    /// Set git context (builder pattern)
    pub fn with_git(mut self, branch: Option<&str>, is_worktree: bool) -> Self {
        self.git = Some(GitInfo {
            branch: branch.map(str::to_string),
            is_worktree,
        });
        self
    }

    pub fn is_worktree(&self) -> bool {
        self.git.as_ref().is_some_and(|g| g.is_worktree)
    }
}

/// Read access (and record CRUD) for server definitions
pub trait ConfigStore: Send + Sync {
    /// Look up one definition by name
    fn get(&self, name: &str) -> Result<Option<ServerConfig>, StoreError>;

    /// All definitions, sorted by name
    fn list(&self) -> Result<Vec<ServerConfig>, StoreError>;

    /// Insert or replace a definition
    fn put(&self, config: ServerConfig) -> Result<(), StoreError>;

    /// Remove a definition, returning whether it existed
    fn remove(&self, name: &str) -> Result<bool, StoreError>;
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Store backed by one pretty-printed JSON file per server
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })
    }

    fn read_file(path: &Path) -> Result<ServerConfig, StoreError> {
        let content = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl ConfigStore for FileStore {
    fn get(&self, name: &str) -> Result<Option<ServerConfig>, StoreError> {
        validate_name(name)?;
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        match Self::read_file(&path) {
            Ok(config) => Ok(Some(config)),
            Err(e @ StoreError::Parse { .. }) => {
                warn!(error = %e, "Ignoring malformed server config");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn list(&self) -> Result<Vec<ServerConfig>, StoreError> {
        self.ensure_dir()?;
        let entries = std::fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut configs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_file(&path) {
                Ok(config) => configs.push(config),
                Err(e) => debug!(error = %e, "Skipping unreadable server config"),
            }
        }
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configs)
    }

    fn put(&self, config: ServerConfig) -> Result<(), StoreError> {
        validate_name(&config.name)?;
        self.ensure_dir()?;
        let path = self.path_for(&config.name);
        let json = serde_json::to_string_pretty(&config).map_err(|source| StoreError::Parse {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, json).map_err(|source| StoreError::Io { path, source })
    }

    fn remove(&self, name: &str) -> Result<bool, StoreError> {
        validate_name(name)?;
        let path = self.path_for(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

/// In-memory store, for embedding and tests
#[derive(Default)]
pub struct MemoryStore {
    configs: RwLock<BTreeMap<String, ServerConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with definitions
    pub fn with_configs(configs: impl IntoIterator<Item = ServerConfig>) -> Self {
        let store = Self::new();
        {
            let mut map = store.configs.write();
            for config in configs {
                map.insert(config.name.clone(), config);
            }
        }
        store
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, name: &str) -> Result<Option<ServerConfig>, StoreError> {
        Ok(self.configs.read().get(name).cloned())
    }

    fn list(&self) -> Result<Vec<ServerConfig>, StoreError> {
        Ok(self.configs.read().values().cloned().collect())
    }

    fn put(&self, config: ServerConfig) -> Result<(), StoreError> {
        validate_name(&config.name)?;
        self.configs.write().insert(config.name.clone(), config);
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.configs.write().remove(name).is_some())
    }
}
