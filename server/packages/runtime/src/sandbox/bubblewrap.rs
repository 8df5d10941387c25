use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::{ExtraPaths, FinalizedSandboxConfig, SandboxAdapter, SandboxError, ValidateFuture};
use crate::launch::LaunchSpec;

const BWRAP: &str = "bwrap";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read-only system locations every sandboxed process needs to exec anything.
const SYSTEM_READ_PATHS: &[&str] = &[
    "/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/etc", "/opt", "/nix/store",
];

/// Linux sandbox built on bubblewrap namespaces and bind mounts.
#[derive(Debug, Clone)]
pub struct Bubblewrap {
    binary: Option<PathBuf>,
}

impl Bubblewrap {
    /// Looks `bwrap` up on `PATH`; a missing binary is reported by
    /// [`SandboxAdapter::validate`].
    pub fn locate() -> Self {
        Self {
            binary: which::which(BWRAP).ok(),
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: Some(binary.into()),
        }
    }

    fn program(&self) -> PathBuf {
        self.binary.clone().unwrap_or_else(|| PathBuf::from(BWRAP))
    }
}

impl SandboxAdapter for Bubblewrap {
    fn name(&self) -> &'static str {
        "bubblewrap"
    }

    fn validate(&self) -> ValidateFuture<'_> {
        Box::pin(async move {
            let binary = self.binary.as_ref().ok_or_else(|| SandboxError::NotFound {
                binary: BWRAP.to_string(),
            })?;
            probe(binary).await
        })
    }

    fn build_sandbox_args(
        &self,
        launch: &LaunchSpec,
        config: &FinalizedSandboxConfig,
        extra: &ExtraPaths,
    ) -> LaunchSpec {
        let mut args: Vec<String> = vec![
            "--die-with-parent".to_string(),
            "--new-session".to_string(),
            "--unshare-pid".to_string(),
        ];
        if !config.networking {
            args.push("--unshare-net".to_string());
        }
        args.extend(["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"].map(String::from));

        for path in SYSTEM_READ_PATHS {
            push_bind(&mut args, "--ro-bind-try", Path::new(path));
        }
        for path in extra.merged_read(config) {
            push_bind(&mut args, "--ro-bind-try", &path);
        }
        // Later binds win, so writable paths go last.
        for path in extra.merged_read_write(config) {
            push_bind(&mut args, "--bind-try", &path);
        }

        args.push("--".to_string());
        args.extend(launch.argv());

        LaunchSpec {
            program: self.program(),
            args,
            env: launch.env.clone(),
        }
    }
}

fn push_bind(args: &mut Vec<String>, flag: &str, path: &Path) {
    let path = path.to_string_lossy().into_owned();
    args.push(flag.to_string());
    args.push(path.clone());
    args.push(path);
}

/// Runs a trivial confined command so hosts without unprivileged user
/// namespaces are caught before a server is launched.
async fn probe(binary: &Path) -> Result<(), SandboxError> {
    let mut command = Command::new(binary);
    command
        .args(["--ro-bind", "/", "/", "--dev", "/dev", "--", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let unusable = |message: String| SandboxError::Unusable {
        binary: binary.to_string_lossy().into_owned(),
        message,
    };

    let output = tokio::time::timeout(PROBE_TIMEOUT, command.output())
        .await
        .map_err(|_| unusable("probe timed out".to_string()))?
        .map_err(|err| unusable(err.to_string()))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(unusable(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch() -> LaunchSpec {
        LaunchSpec::new("/bin/sh", vec!["/tmp/mcpadre-abc.sh".to_string()])
    }

    fn config(networking: bool) -> FinalizedSandboxConfig {
        FinalizedSandboxConfig {
            enabled: true,
            networking,
            allow_read: vec![PathBuf::from("/proj")],
            allow_read_write: vec![PathBuf::from("/proj/out")],
        }
    }

    fn window(args: &[String], flag: &str, path: &str) -> bool {
        args.windows(3)
            .any(|w| w[0] == flag && w[1] == path && w[2] == path)
    }

    #[test]
    fn builds_bind_layout_and_keeps_command_last() {
        let extra = ExtraPaths {
            read: vec![PathBuf::from("/bin/sh"), PathBuf::from("/tmp/mcpadre-abc.sh")],
            read_write: vec![],
        };
        let wrapped = Bubblewrap::with_binary("/usr/bin/bwrap").build_sandbox_args(
            &launch(),
            &config(true),
            &extra,
        );

        assert_eq!(wrapped.program, PathBuf::from("/usr/bin/bwrap"));
        let args = &wrapped.args;
        assert!(!args.contains(&"--unshare-net".to_string()));
        assert!(window(args, "--ro-bind-try", "/proj"));
        assert!(window(args, "--ro-bind-try", "/tmp/mcpadre-abc.sh"));
        assert!(window(args, "--bind-try", "/proj/out"));

        let tmpfs = args.iter().position(|a| a == "/tmp").unwrap();
        let script = args.iter().position(|a| a == "/tmp/mcpadre-abc.sh").unwrap();
        assert!(tmpfs < script, "script bind must come after the /tmp tmpfs");

        let separator = args.iter().rposition(|a| a == "--").unwrap();
        assert_eq!(&args[separator + 1..], &["/bin/sh", "/tmp/mcpadre-abc.sh"]);
    }

    #[test]
    fn networking_off_unshares_net() {
        let wrapped = Bubblewrap::with_binary("bwrap").build_sandbox_args(
            &launch(),
            &config(false),
            &ExtraPaths::default(),
        );
        assert!(wrapped.args.contains(&"--unshare-net".to_string()));
    }

    #[tokio::test]
    async fn missing_binary_fails_validation() {
        let sandbox = Bubblewrap { binary: None };
        assert!(matches!(
            sandbox.validate().await,
            Err(SandboxError::NotFound { .. })
        ));
    }
}
