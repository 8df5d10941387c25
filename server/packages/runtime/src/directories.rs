//! Resolved directory layout for one run.

use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const APP_DIR: &str = "mcpadre";
const USER_DIR_ENV: &str = "MCPADRE_USER_DIR";

/// Which configuration context a run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionScope {
    /// Project-local configuration rooted at a workspace directory.
    Project,
    /// Global per-user configuration.
    User,
}

/// A directory that templates and env values may refer to by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryKind {
    Home,
    Config,
    Cache,
    Data,
    Log,
    Temp,
    Workspace,
}

impl DirectoryKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "home" => Some(Self::Home),
            "config" => Some(Self::Config),
            "cache" => Some(Self::Cache),
            "data" => Some(Self::Data),
            "log" => Some(Self::Log),
            "temp" => Some(Self::Temp),
            "workspace" => Some(Self::Workspace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryResolver {
    home: PathBuf,
    config: PathBuf,
    cache: PathBuf,
    data: PathBuf,
    log: PathBuf,
    temp: PathBuf,
    workspace: PathBuf,
    scope: ExecutionScope,
}

impl DirectoryResolver {
    /// Layout for a project-scope run rooted at `workspace`.
    pub fn for_project(workspace: impl AsRef<Path>) -> Self {
        let workspace = absolutize(workspace.as_ref());
        Self::from_platform(workspace, ExecutionScope::Project)
    }

    /// Layout for a user-scope run; the workspace is the user directory
    /// (`$MCPADRE_USER_DIR`, falling back to `~/.mcpadre`).
    pub fn for_user() -> Self {
        let workspace = match std::env::var_os(USER_DIR_ENV) {
            Some(dir) if !dir.is_empty() => absolutize(Path::new(&dir)),
            _ => home_dir().join(".mcpadre"),
        };
        Self::from_platform(workspace, ExecutionScope::User)
    }

    fn from_platform(workspace: PathBuf, scope: ExecutionScope) -> Self {
        let home = home_dir();
        let config = dirs::config_dir()
            .unwrap_or_else(|| home.join(".config"))
            .join(APP_DIR);
        let cache = dirs::cache_dir().unwrap_or_else(|| home.join(".cache"));
        let data = dirs::data_dir()
            .unwrap_or_else(|| home.join(".local").join("share"))
            .join(APP_DIR);
        let log = data.join("logs");
        Self {
            home,
            config,
            cache,
            data,
            log,
            temp: std::env::temp_dir(),
            workspace,
            scope,
        }
    }

    /// Fully explicit layout, used by collaborators that resolved paths
    /// themselves and by tests.
    pub fn from_parts(root: impl AsRef<Path>, workspace: impl AsRef<Path>, scope: ExecutionScope) -> Self {
        let root = absolutize(root.as_ref());
        Self {
            home: root.join("home"),
            config: root.join("config"),
            cache: root.join("cache"),
            data: root.join("data"),
            log: root.join("log"),
            temp: root.join("tmp"),
            workspace: absolutize(workspace.as_ref()),
            scope,
        }
    }

    pub fn get(&self, kind: DirectoryKind) -> &Path {
        match kind {
            DirectoryKind::Home => &self.home,
            DirectoryKind::Config => &self.config,
            DirectoryKind::Cache => &self.cache,
            DirectoryKind::Data => &self.data,
            DirectoryKind::Log => &self.log,
            DirectoryKind::Temp => &self.temp,
            DirectoryKind::Workspace => &self.workspace,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn cache(&self) -> &Path {
        &self.cache
    }

    pub fn log(&self) -> &Path {
        &self.log
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn scope(&self) -> ExecutionScope {
        self.scope
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(std::env::temp_dir)
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
