//! Configuration for the session manager and individual sessions.

use crate::listener::{ErrorHandler, UnhandledErrorHook};
use crate::state::StopPolicy;
use crate::user::{User, UserId};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// File extension of local database files.
pub const DATABASE_EXTENSION: &str = "tether";

/// Default name of the directory that holds client reset backups.
pub const DEFAULT_RECOVERY_DIR: &str = "recovery";

/// Value identifying the remote data subset a session synchronizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitionValue {
    /// String partition.
    String(String),
    /// 32-bit integer partition.
    Int32(i32),
    /// 64-bit integer partition.
    Int64(i64),
    /// 12-byte object id partition.
    ObjectId([u8; 12]),
}

impl PartitionValue {
    /// Returns a file-name-safe rendering, distinct per value and type.
    pub fn file_component(&self) -> String {
        match self {
            PartitionValue::String(s) => format!("s_{}", escape_component(s)),
            PartitionValue::Int32(n) => format!("i32_{n}"),
            PartitionValue::Int64(n) => format!("i64_{n}"),
            PartitionValue::ObjectId(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
                format!("oid_{hex}")
            }
        }
    }
}

impl fmt::Display for PartitionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionValue::String(s) => write!(f, "{s:?}"),
            PartitionValue::Int32(n) => write!(f, "{n}"),
            PartitionValue::Int64(n) => write!(f, "{n}L"),
            PartitionValue::ObjectId(_) => write!(f, "ObjectId({})", self.file_component()),
        }
    }
}

impl From<&str> for PartitionValue {
    fn from(value: &str) -> Self {
        PartitionValue::String(value.to_string())
    }
}

impl From<String> for PartitionValue {
    fn from(value: String) -> Self {
        PartitionValue::String(value)
    }
}

impl From<i32> for PartitionValue {
    fn from(value: i32) -> Self {
        PartitionValue::Int32(value)
    }
}

impl From<i64> for PartitionValue {
    fn from(value: i64) -> Self {
        PartitionValue::Int64(value)
    }
}

/// How database file paths are derived from a session configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathStrategy {
    /// One file per user and partition value.
    #[default]
    PerPartition,
    /// One file per user; sessions for different partitions share it.
    PerUser,
}

/// Configuration for a [`SessionManager`](crate::SessionManager).
#[derive(Clone)]
pub struct ManagerConfig {
    /// Root directory for database files.
    pub base_dir: PathBuf,
    /// Path derivation strategy.
    pub path_strategy: PathStrategy,
    /// Name of the backup directory, next to each database file.
    pub recovery_dir_name: String,
    /// Whether connection listeners are invoked at all.
    pub connection_callbacks: bool,
    /// Receives panics raised by listeners.
    pub unhandled_error_hook: Option<UnhandledErrorHook>,
}

impl ManagerConfig {
    /// Creates a configuration rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            path_strategy: PathStrategy::default(),
            recovery_dir_name: DEFAULT_RECOVERY_DIR.to_string(),
            connection_callbacks: true,
            unhandled_error_hook: None,
        }
    }

    /// Sets the path strategy.
    pub fn with_path_strategy(mut self, strategy: PathStrategy) -> Self {
        self.path_strategy = strategy;
        self
    }

    /// Sets the recovery directory name.
    pub fn with_recovery_dir_name(mut self, name: impl Into<String>) -> Self {
        self.recovery_dir_name = name.into();
        self
    }

    /// Enables or disables connection listener callbacks.
    pub fn with_connection_callbacks(mut self, enabled: bool) -> Self {
        self.connection_callbacks = enabled;
        self
    }

    /// Sets the hook receiving listener panics.
    pub fn with_unhandled_error_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.unhandled_error_hook = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("base_dir", &self.base_dir)
            .field("path_strategy", &self.path_strategy)
            .field("recovery_dir_name", &self.recovery_dir_name)
            .field("connection_callbacks", &self.connection_callbacks)
            .field("unhandled_error_hook", &self.unhandled_error_hook.is_some())
            .finish()
    }
}

/// Configuration for opening one synchronized database.
#[derive(Clone)]
pub struct SessionConfig {
    /// Owner of the session.
    pub user_id: UserId,
    /// Remote data subset to synchronize.
    pub partition: PartitionValue,
    /// Stop policy of the session.
    pub stop_policy: StopPolicy,
    /// Error handler, invoked for fatal errors.
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
    /// If set, opening blocks until the first download completes.
    pub initial_download: Option<Duration>,
    /// Explicit file name, overriding the derived one.
    pub file_name: Option<String>,
}

impl SessionConfig {
    /// Creates a configuration for `user` and `partition`.
    pub fn new(user: &User, partition: impl Into<PartitionValue>) -> Self {
        Self::for_user_id(user.id().clone(), partition)
    }

    /// Creates a configuration from a bare user id.
    pub fn for_user_id(user_id: UserId, partition: impl Into<PartitionValue>) -> Self {
        Self {
            user_id,
            partition: partition.into(),
            stop_policy: StopPolicy::default(),
            error_handler: None,
            initial_download: None,
            file_name: None,
        }
    }

    /// Sets the stop policy.
    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    /// Sets the error handler.
    pub fn with_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Waits for the initial download on open, up to `timeout`.
    pub fn with_initial_download(mut self, timeout: Duration) -> Self {
        self.initial_download = Some(timeout);
        self
    }

    /// Uses an explicit file name inside the user's directory.
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// Resolves the database file path under `manager`'s settings.
    pub fn resolve_path(&self, manager: &ManagerConfig) -> PathBuf {
        let user_dir = manager
            .base_dir
            .join(escape_component(self.user_id.as_str()));
        let file_name = match (&self.file_name, manager.path_strategy) {
            (Some(name), _) => escape_file_name(name),
            (None, PathStrategy::PerPartition) => {
                format!("{}.{DATABASE_EXTENSION}", self.partition.file_component())
            }
            (None, PathStrategy::PerUser) => format!("default.{DATABASE_EXTENSION}"),
        };
        user_dir.join(file_name)
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("user_id", &self.user_id)
            .field("partition", &self.partition)
            .field("stop_policy", &self.stop_policy)
            .field("error_handler", &self.error_handler.is_some())
            .field("initial_download", &self.initial_download)
            .field("file_name", &self.file_name)
            .finish()
    }
}

/// Percent-escapes everything outside `[A-Za-z0-9_-]`.
fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Keeps an explicit file name a single component of the user's directory.
fn escape_file_name(raw: &str) -> String {
    if raw.is_empty() {
        return format!("default.{DATABASE_EXTENSION}");
    }
    if raw.bytes().all(|b| b == b'.') {
        return raw.bytes().map(|b| format!("%{b:02X}")).collect();
    }
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '/' | '\\' | '\0' | '%' => out.push_str(&format!("%{:02X}", ch as u32)),
            _ => out.push(ch),
        }
    }
    out
}

/// Returns true if `path` looks like a database file of this crate.
pub fn is_database_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == DATABASE_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(partition: impl Into<PartitionValue>) -> SessionConfig {
        SessionConfig::for_user_id(UserId::from("alice"), partition)
    }

    #[test]
    fn partition_components_are_distinct() {
        let values = [
            PartitionValue::from("123"),
            PartitionValue::from(123i32),
            PartitionValue::from(123i64),
            PartitionValue::ObjectId([0x5e; 12]),
        ];
        let mut components: Vec<_> = values.iter().map(|v| v.file_component()).collect();
        components.sort();
        components.dedup();
        assert_eq!(components.len(), 4);
    }

    #[test]
    fn escaping_keeps_paths_flat() {
        assert_eq!(escape_component("a/b c"), "a%2Fb%20c");
        assert_eq!(escape_component("..").as_str(), "%2E%2E");
        assert_eq!(escape_component("user-1_x"), "user-1_x");
    }

    #[test]
    fn per_partition_paths_differ() {
        let manager = ManagerConfig::new("/data");
        let a = config("partitionvalue1").resolve_path(&manager);
        let b = config("partitionvalue2").resolve_path(&manager);
        assert_ne!(a, b);
        assert_eq!(a, PathBuf::from("/data/alice/s_partitionvalue1.tether"));
        assert!(is_database_file(&a));
    }

    #[test]
    fn per_user_paths_are_shared() {
        let manager = ManagerConfig::new("/data").with_path_strategy(PathStrategy::PerUser);
        let a = config("partitionvalue1").resolve_path(&manager);
        let b = config("partitionvalue2").resolve_path(&manager);
        assert_eq!(a, b);
    }

    #[test]
    fn explicit_file_name_wins() {
        let manager = ManagerConfig::new("/data");
        let path = config(1i32).with_file_name("custom.tether").resolve_path(&manager);
        assert_eq!(path, PathBuf::from("/data/alice/custom.tether"));
    }

    #[test]
    fn explicit_file_name_stays_in_user_dir() {
        let manager = ManagerConfig::new("/data");
        let user_dir = PathBuf::from("/data/alice");
        for name in ["../x", "..", "a/../../b", "..\\x", ""] {
            let path = config(1i32).with_file_name(name).resolve_path(&manager);
            assert_eq!(path.parent(), Some(user_dir.as_path()), "{name:?} -> {path:?}");
        }
        let path = config(1i32).with_file_name("../x").resolve_path(&manager);
        assert_eq!(path, PathBuf::from("/data/alice/..%2Fx"));
    }

    #[test]
    fn session_config_builder() {
        let config = config("p")
            .with_stop_policy(StopPolicy::Never)
            .with_initial_download(Duration::from_secs(5));
        assert_eq!(config.stop_policy, StopPolicy::Never);
        assert_eq!(config.initial_download, Some(Duration::from_secs(5)));
        assert!(config.error_handler.is_none());
    }

    #[test]
    fn manager_config_defaults() {
        let config = ManagerConfig::new("/tmp/x");
        assert_eq!(config.path_strategy, PathStrategy::PerPartition);
        assert_eq!(config.recovery_dir_name, DEFAULT_RECOVERY_DIR);
        assert!(config.connection_callbacks);
        assert!(config.unhandled_error_hook.is_none());
    }
}
