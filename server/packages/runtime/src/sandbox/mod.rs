//! Sandbox policy resolution and OS sandbox wrapping.
//!
//! | Platform | Primitive | Adapter |
//! |----------|-----------|---------|
//! | Linux | bubblewrap (`bwrap`) | [`Bubblewrap`] |
//! | macOS | Seatbelt (`sandbox-exec`) | [`Seatbelt`] |
//! | other | none | [`Unsupported`] |
//!
//! A sandbox that cannot be used never stops a server from starting: the
//! invocation falls back to running unsandboxed with a warning.

mod bubblewrap;
mod seatbelt;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use thiserror::Error;

use crate::config::SandboxConfig;
use crate::directories::{DirectoryResolver, ExecutionScope};
use crate::launch::LaunchSpec;
use crate::template::{TemplateContext, TemplateError};

pub use bubblewrap::Bubblewrap;
pub use seatbelt::Seatbelt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(windows) {
            Self::Windows
        } else {
            Self::Other
        }
    }

    pub fn is_windows(self) -> bool {
        self == Self::Windows
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOs => "macos",
            Self::Windows => "windows",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox binary `{binary}` not found")]
    NotFound { binary: String },
    #[error("sandbox binary `{binary}` is not usable: {message}")]
    Unusable { binary: String, message: String },
    #[error("no sandbox available on platform `{platform}`")]
    Unsupported { platform: &'static str },
}

/// Resolved sandbox policy: every template rendered, every path absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedSandboxConfig {
    pub enabled: bool,
    pub networking: bool,
    pub allow_read: Vec<PathBuf>,
    pub allow_read_write: Vec<PathBuf>,
}

impl FinalizedSandboxConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            networking: true,
            allow_read: Vec::new(),
            allow_read_write: Vec::new(),
        }
    }
}

/// Inputs needed to finalize a [`SandboxConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SandboxContext<'a> {
    pub dirs: &'a DirectoryResolver,
    pub parent_env: &'a HashMap<String, String>,
    /// Workspace-wide switch that turns every sandbox off.
    pub disable_all_sandboxes: bool,
}

/// Resolves a declared policy. Enablement precedence: the workspace-wide
/// override, then the explicit flag, then the scope default (project on,
/// user off). Networking defaults to on.
pub fn finalize_sandbox_config(
    config: Option<&SandboxConfig>,
    ctx: &SandboxContext<'_>,
) -> Result<FinalizedSandboxConfig, TemplateError> {
    let declared = config.cloned().unwrap_or_default();
    let scope_default = matches!(ctx.dirs.scope(), ExecutionScope::Project);
    let enabled = !ctx.disable_all_sandboxes && declared.enabled.unwrap_or(scope_default);

    let templates = TemplateContext::new(ctx.dirs, ctx.parent_env);
    let workspace = ctx.dirs.workspace();

    let mut allow_read = Vec::new();
    if !declared.omit_workspace_path {
        allow_read.push(workspace.to_path_buf());
    }
    for raw in &declared.allow_read {
        allow_read.push(resolve_path(&templates.render(raw)?, workspace));
    }

    let mut allow_read_write = Vec::new();
    for raw in &declared.allow_read_write {
        allow_read_write.push(resolve_path(&templates.render(raw)?, workspace));
    }

    Ok(FinalizedSandboxConfig {
        enabled,
        networking: declared.networking.unwrap_or(true),
        allow_read: dedup(allow_read),
        allow_read_write: dedup(allow_read_write),
    })
}

fn resolve_path(rendered: &str, workspace: &Path) -> PathBuf {
    let path = PathBuf::from(rendered);
    if path.is_absolute() {
        path
    } else {
        workspace.join(path)
    }
}

fn dedup(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    paths
        .into_iter()
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

/// Paths a runtime needs beyond the declared policy (interpreters, scripts,
/// package caches).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraPaths {
    pub read: Vec<PathBuf>,
    pub read_write: Vec<PathBuf>,
}

impl ExtraPaths {
    pub fn merged_read(&self, config: &FinalizedSandboxConfig) -> Vec<PathBuf> {
        dedup(config.allow_read.iter().chain(&self.read).cloned().collect())
    }

    pub fn merged_read_write(&self, config: &FinalizedSandboxConfig) -> Vec<PathBuf> {
        dedup(
            config
                .allow_read_write
                .iter()
                .chain(&self.read_write)
                .cloned()
                .collect(),
        )
    }
}

pub type ValidateFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SandboxError>> + Send + 'a>>;

/// An OS sandboxing primitive.
pub trait SandboxAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Checks that the primitive is present and runnable on this host.
    fn validate(&self) -> ValidateFuture<'_>;

    /// Wraps `launch` so it runs confined by `config` plus `extra`.
    fn build_sandbox_args(
        &self,
        launch: &LaunchSpec,
        config: &FinalizedSandboxConfig,
        extra: &ExtraPaths,
    ) -> LaunchSpec;
}

/// Adapter for platforms without a supported primitive; never validates.
#[derive(Debug, Clone, Copy)]
pub struct Unsupported {
    platform: Platform,
}

impl SandboxAdapter for Unsupported {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn validate(&self) -> ValidateFuture<'_> {
        let platform = self.platform.as_str();
        Box::pin(async move { Err(SandboxError::Unsupported { platform }) })
    }

    fn build_sandbox_args(
        &self,
        launch: &LaunchSpec,
        _config: &FinalizedSandboxConfig,
        _extra: &ExtraPaths,
    ) -> LaunchSpec {
        launch.clone()
    }
}

pub fn sandbox_for_platform(platform: Platform) -> Box<dyn SandboxAdapter> {
    match platform {
        Platform::Linux => Box::new(Bubblewrap::locate()),
        Platform::MacOs => Box::new(Seatbelt::default()),
        Platform::Windows | Platform::Other => Box::new(Unsupported { platform }),
    }
}

/// Applies the sandbox to `launch` when enabled and usable; otherwise
/// returns it untouched.
pub async fn wrap_invocation(
    adapter: &dyn SandboxAdapter,
    config: &FinalizedSandboxConfig,
    launch: LaunchSpec,
    extra: &ExtraPaths,
) -> LaunchSpec {
    if !config.enabled {
        tracing::debug!(command = %launch.display(), "sandbox disabled");
        return launch;
    }

    if let Err(err) = adapter.validate().await {
        tracing::warn!(
            sandbox = adapter.name(),
            error = %err,
            command = %launch.display(),
            "sandbox unavailable, running unsandboxed"
        );
        return launch;
    }

    let wrapped = adapter.build_sandbox_args(&launch, config, extra);
    tracing::info!(
        sandbox = adapter.name(),
        networking = config.networking,
        read_paths = config.allow_read.len() + extra.read.len(),
        write_paths = config.allow_read_write.len() + extra.read_write.len(),
        "sandbox applied"
    );
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSandbox {
        usable: bool,
        validations: AtomicUsize,
    }

    impl FakeSandbox {
        fn new(usable: bool) -> Self {
            Self {
                usable,
                validations: AtomicUsize::new(0),
            }
        }
    }

    impl SandboxAdapter for FakeSandbox {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn validate(&self) -> ValidateFuture<'_> {
            self.validations.fetch_add(1, Ordering::SeqCst);
            let usable = self.usable;
            Box::pin(async move {
                if usable {
                    Ok(())
                } else {
                    Err(SandboxError::NotFound {
                        binary: "fake-jail".to_string(),
                    })
                }
            })
        }

        fn build_sandbox_args(
            &self,
            launch: &LaunchSpec,
            _config: &FinalizedSandboxConfig,
            _extra: &ExtraPaths,
        ) -> LaunchSpec {
            let mut args = vec!["--".to_string()];
            args.extend(launch.argv());
            LaunchSpec::new("fake-jail", args)
        }
    }

    fn project_dirs() -> DirectoryResolver {
        DirectoryResolver::from_parts("/r", "/proj", ExecutionScope::Project)
    }

    fn ctx<'a>(
        dirs: &'a DirectoryResolver,
        env: &'a HashMap<String, String>,
        disable_all: bool,
    ) -> SandboxContext<'a> {
        SandboxContext {
            dirs,
            parent_env: env,
            disable_all_sandboxes: disable_all,
        }
    }

    #[test]
    fn scope_decides_default_enablement() {
        let env = HashMap::new();
        let project = project_dirs();
        let user = DirectoryResolver::from_parts("/r", "/home/u/.mcpadre", ExecutionScope::User);

        assert!(finalize_sandbox_config(None, &ctx(&project, &env, false)).unwrap().enabled);
        assert!(!finalize_sandbox_config(None, &ctx(&user, &env, false)).unwrap().enabled);

        let explicit = SandboxConfig {
            enabled: Some(true),
            ..SandboxConfig::default()
        };
        assert!(finalize_sandbox_config(Some(&explicit), &ctx(&user, &env, false)).unwrap().enabled);
        assert!(!finalize_sandbox_config(Some(&explicit), &ctx(&project, &env, true)).unwrap().enabled);
    }

    #[test]
    fn paths_are_rendered_and_absolute() {
        let env = HashMap::from([("DATA".to_string(), "/mnt/data".to_string())]);
        let dirs = project_dirs();
        let config = SandboxConfig {
            networking: Some(false),
            allow_read: vec![
                "{{dirs.home}}/.gitconfig".to_string(),
                "docs".to_string(),
                "/proj".to_string(),
            ],
            allow_read_write: vec!["{{parentEnv.DATA}}".to_string()],
            ..SandboxConfig::default()
        };

        let finalized = finalize_sandbox_config(Some(&config), &ctx(&dirs, &env, false)).unwrap();
        assert!(!finalized.networking);
        assert_eq!(
            finalized.allow_read,
            vec![
                PathBuf::from("/proj"),
                PathBuf::from("/r/home/.gitconfig"),
                PathBuf::from("/proj/docs"),
            ]
        );
        assert_eq!(finalized.allow_read_write, vec![PathBuf::from("/mnt/data")]);
    }

    #[test]
    fn workspace_path_can_be_omitted() {
        let env = HashMap::new();
        let dirs = project_dirs();
        let config = SandboxConfig {
            omit_workspace_path: true,
            ..SandboxConfig::default()
        };
        let finalized = finalize_sandbox_config(Some(&config), &ctx(&dirs, &env, false)).unwrap();
        assert!(finalized.allow_read.is_empty());
    }

    #[test]
    fn template_errors_surface() {
        let env = HashMap::new();
        let dirs = project_dirs();
        let config = SandboxConfig {
            allow_read: vec!["{{dirs.bogus}}".to_string()],
            ..SandboxConfig::default()
        };
        assert!(finalize_sandbox_config(Some(&config), &ctx(&dirs, &env, false)).is_err());
    }

    #[tokio::test]
    async fn unusable_sandbox_falls_back_to_plain_invocation() {
        let sandbox = FakeSandbox::new(false);
        let config = FinalizedSandboxConfig {
            enabled: true,
            ..FinalizedSandboxConfig::disabled()
        };
        let launch = LaunchSpec::new("/bin/sh", vec!["server.sh".to_string()]);

        let result = wrap_invocation(&sandbox, &config, launch.clone(), &ExtraPaths::default()).await;
        assert_eq!(result, launch);
        assert_eq!(sandbox.validations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn usable_sandbox_wraps_and_disabled_skips_validation() {
        let sandbox = FakeSandbox::new(true);
        let launch = LaunchSpec::new("/bin/sh", vec!["server.sh".to_string()]);

        let enabled = FinalizedSandboxConfig {
            enabled: true,
            ..FinalizedSandboxConfig::disabled()
        };
        let wrapped = wrap_invocation(&sandbox, &enabled, launch.clone(), &ExtraPaths::default()).await;
        assert_eq!(wrapped.program, PathBuf::from("fake-jail"));
        assert_eq!(wrapped.args, vec!["--", "/bin/sh", "server.sh"]);

        let untouched = wrap_invocation(
            &sandbox,
            &FinalizedSandboxConfig::disabled(),
            launch.clone(),
            &ExtraPaths::default(),
        )
        .await;
        assert_eq!(untouched, launch);
        assert_eq!(sandbox.validations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsupported_platform_never_validates() {
        let adapter = sandbox_for_platform(Platform::Windows);
        assert!(matches!(
            adapter.validate().await,
            Err(SandboxError::Unsupported { platform: "windows" })
        ));
    }

    #[test]
    fn extra_paths_merge_without_duplicates() {
        let config = FinalizedSandboxConfig {
            enabled: true,
            networking: true,
            allow_read: vec![PathBuf::from("/proj")],
            allow_read_write: vec![],
        };
        let extra = ExtraPaths {
            read: vec![PathBuf::from("/bin/sh"), PathBuf::from("/proj")],
            read_write: vec![PathBuf::from("/home/u/.npm")],
        };
        assert_eq!(
            extra.merged_read(&config),
            vec![PathBuf::from("/proj"), PathBuf::from("/bin/sh")]
        );
        assert_eq!(extra.merged_read_write(&config), vec![PathBuf::from("/home/u/.npm")]);
    }
}
