use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::directories::DirectoryKind;
use crate::template::{TemplateContext, TemplateError};

const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
const DEFAULT_MAX_PENDING_REQUESTS: usize = 1024;

/// One tool server, as handed over by the configuration layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub runtime: ServerRuntime,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, EnvValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxConfig>,
    /// Append every request/response pair to a traffic log.
    #[serde(default)]
    pub record: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ServerRuntime {
    Shell(ShellServer),
    Node(NodePackage),
    Python(PythonPackage),
    Container(ContainerImage),
}

impl ServerRuntime {
    pub fn family(&self) -> &'static str {
        match self {
            Self::Shell(_) => "shell",
            Self::Node(_) => "node",
            Self::Python(_) => "python",
            Self::Container(_) => "container",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShellServer {
    /// Shell command line; may contain `{{...}}` templates.
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePackage {
    pub package: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PythonPackage {
    pub package: String,
    pub version: String,
    /// Entry point to run; defaults to the package name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImage {
    pub image: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<ContainerVolume>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerVolume {
    /// Host path; may contain `{{...}}` templates.
    pub host: String,
    pub container: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Environment variable value for a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum EnvValue {
    /// Rendered through the template engine.
    Template(String),
    /// Used verbatim.
    Literal { string: String },
    /// One of the resolved directories.
    Special { special: DirectoryKind },
    /// Copied from the parent environment; unset renders empty.
    Pass { pass: String },
}

impl EnvValue {
    pub fn resolve(&self, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
        match self {
            Self::Template(template) => ctx.render(template),
            Self::Literal { string } => Ok(string.clone()),
            Self::Special { special } => Ok(ctx.dirs.get(*special).to_string_lossy().into_owned()),
            Self::Pass { pass } => Ok(ctx.parent_env.get(pass).cloned().unwrap_or_default()),
        }
    }
}

impl ServerConfig {
    pub fn resolve_env(
        &self,
        ctx: &TemplateContext<'_>,
    ) -> Result<BTreeMap<String, String>, TemplateError> {
        self.env
            .iter()
            .map(|(key, value)| Ok((key.clone(), value.resolve(ctx)?)))
            .collect()
    }
}

/// User-declared sandbox policy, before template resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// `None` means "use the scope default".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_read: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_read_write: Vec<String>,
    #[serde(default)]
    pub omit_workspace_path: bool,
}

/// Process-level knobs that are not part of a server definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeTunables {
    /// How long a child gets between SIGTERM and SIGKILL.
    pub shutdown_grace: Duration,
    /// Upper bound on in-flight requests per multiplexer.
    pub max_pending_requests: usize,
}

impl Default for RuntimeTunables {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
        }
    }
}

impl RuntimeTunables {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            shutdown_grace: duration_from_env_ms("MCPADRE_SHUTDOWN_GRACE_MS", defaults.shutdown_grace),
            max_pending_requests: usize_from_env(
                "MCPADRE_MAX_PENDING_REQUESTS",
                defaults.max_pending_requests,
            ),
        }
    }
}

/// Snapshot of the current process environment.
pub fn parent_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

fn duration_from_env_ms(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|value| *value > 0)
            .map(Duration::from_millis)
            .unwrap_or(default),
        Err(_) => default,
    }
}

fn usize_from_env(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directories::{DirectoryResolver, ExecutionScope};
    use serde_json::json;
    use serial_test::serial;

    #[test]
    fn parses_each_runtime_family() {
        let shell: ServerConfig = serde_json::from_value(json!({
            "name": "files",
            "shell": {"command": "my-server --stdio"},
            "record": true
        }))
        .unwrap();
        assert_eq!(shell.runtime.family(), "shell");
        assert!(shell.record);

        let node: ServerConfig = serde_json::from_value(json!({
            "name": "fetch",
            "node": {"package": "@acme/fetch", "version": "1.2.3", "args": ["--verbose"]},
            "sandbox": {"networking": false, "allowRead": ["{{dirs.home}}/.fetchrc"]}
        }))
        .unwrap();
        assert!(matches!(&node.runtime, ServerRuntime::Node(pkg) if pkg.args == ["--verbose"]));
        assert_eq!(node.sandbox.unwrap().networking, Some(false));

        let container: ServerConfig = serde_json::from_value(json!({
            "name": "db",
            "container": {
                "image": "ghcr.io/acme/db-mcp",
                "tag": "v2",
                "volumes": [{"host": "{{dirs.workspace}}/data", "container": "/data", "readOnly": true}]
            }
        }))
        .unwrap();
        assert!(matches!(&container.runtime, ServerRuntime::Container(image) if image.volumes[0].read_only));
    }

    #[test]
    fn env_values_resolve() {
        let config: ServerConfig = serde_json::from_value(json!({
            "name": "x",
            "python": {"package": "mcp-x", "version": "0.1.0"},
            "env": {
                "A": "{{dirs.workspace}}/a",
                "B": {"string": "{{not-rendered}}"},
                "C": {"special": "cache"},
                "D": {"pass": "UPSTREAM"}
            }
        }))
        .unwrap();

        let dirs = DirectoryResolver::from_parts("/r", "/w", ExecutionScope::Project);
        let env = HashMap::from([("UPSTREAM".to_string(), "value".to_string())]);
        let resolved = config.resolve_env(&TemplateContext::new(&dirs, &env)).unwrap();

        assert_eq!(resolved["A"], "/w/a");
        assert_eq!(resolved["B"], "{{not-rendered}}");
        assert_eq!(resolved["C"], "/r/cache");
        assert_eq!(resolved["D"], "value");
    }

    #[test]
    #[serial]
    fn tunables_read_environment() {
        std::env::set_var("MCPADRE_SHUTDOWN_GRACE_MS", "250");
        std::env::set_var("MCPADRE_MAX_PENDING_REQUESTS", "not-a-number");
        let tunables = RuntimeTunables::from_env();
        std::env::remove_var("MCPADRE_SHUTDOWN_GRACE_MS");
        std::env::remove_var("MCPADRE_MAX_PENDING_REQUESTS");

        assert_eq!(tunables.shutdown_grace, Duration::from_millis(250));
        assert_eq!(tunables.max_pending_requests, DEFAULT_MAX_PENDING_REQUESTS);
    }
}
