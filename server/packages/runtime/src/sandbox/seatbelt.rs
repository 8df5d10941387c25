use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::{ExtraPaths, FinalizedSandboxConfig, SandboxAdapter, SandboxError, ValidateFuture};
use crate::launch::LaunchSpec;

const SANDBOX_EXEC: &str = "/usr/bin/sandbox-exec";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const BASE_POLICY: &str = r#"(version 1)
(deny default)
(allow process-exec)
(allow process-fork)
(allow signal (target same-sandbox))
(allow sysctl-read)
(allow mach-lookup)
(allow ipc-posix-shm)
(allow file-read-metadata)
(allow file-read*
  (subpath "/usr")
  (subpath "/bin")
  (subpath "/sbin")
  (subpath "/System")
  (subpath "/Library")
  (subpath "/opt")
  (subpath "/private/etc")
  (subpath "/private/var/db")
  (literal "/dev/null")
  (literal "/dev/urandom")
  (literal "/dev/random"))
(allow file-write*
  (literal "/dev/null")
  (literal "/dev/tty"))"#;

const NETWORK_POLICY: &str = "(allow network*)\n(allow system-socket)";

/// macOS sandbox driven by `sandbox-exec` and a generated SBPL profile.
#[derive(Debug, Clone)]
pub struct Seatbelt {
    binary: PathBuf,
}

impl Default for Seatbelt {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(SANDBOX_EXEC),
        }
    }
}

impl Seatbelt {
    /// Builds the profile for `config`; paths are passed as `-D` params so
    /// they never need escaping inside the profile text.
    fn profile(
        config: &FinalizedSandboxConfig,
        read: &[PathBuf],
        read_write: &[PathBuf],
    ) -> (String, Vec<(String, PathBuf)>) {
        let mut params = Vec::new();
        let mut read_rules = Vec::new();
        let mut write_rules = Vec::new();

        for (index, path) in read.iter().enumerate() {
            let key = format!("READ_{index}");
            read_rules.push(format!("(subpath (param \"{key}\"))"));
            params.push((key, path.clone()));
        }
        for (index, path) in read_write.iter().enumerate() {
            let key = format!("WRITE_{index}");
            write_rules.push(format!("(subpath (param \"{key}\"))"));
            params.push((key, path.clone()));
        }

        let mut profile = String::from(BASE_POLICY);
        // Writable paths are readable too.
        let readable: Vec<&String> = read_rules.iter().chain(&write_rules).collect();
        if !readable.is_empty() {
            profile.push_str("\n(allow file-read*");
            for rule in readable {
                profile.push_str("\n  ");
                profile.push_str(rule);
            }
            profile.push(')');
        }
        if !write_rules.is_empty() {
            profile.push_str("\n(allow file-write*");
            for rule in &write_rules {
                profile.push_str("\n  ");
                profile.push_str(rule);
            }
            profile.push(')');
        }
        if config.networking {
            profile.push('\n');
            profile.push_str(NETWORK_POLICY);
        }
        (profile, params)
    }
}

impl SandboxAdapter for Seatbelt {
    fn name(&self) -> &'static str {
        "seatbelt"
    }

    fn validate(&self) -> ValidateFuture<'_> {
        Box::pin(async move {
            if !self.binary.is_file() {
                return Err(SandboxError::NotFound {
                    binary: self.binary.to_string_lossy().into_owned(),
                });
            }
            probe(&self.binary).await
        })
    }

    fn build_sandbox_args(
        &self,
        launch: &LaunchSpec,
        config: &FinalizedSandboxConfig,
        extra: &ExtraPaths,
    ) -> LaunchSpec {
        let read = extra.merged_read(config);
        let read_write = extra.merged_read_write(config);
        let (profile, params) = Self::profile(config, &read, &read_write);

        let mut args = vec!["-p".to_string(), profile];
        args.extend(
            params
                .into_iter()
                .map(|(key, value)| format!("-D{key}={}", value.to_string_lossy())),
        );
        args.push("--".to_string());
        args.extend(launch.argv());

        LaunchSpec {
            program: self.binary.clone(),
            args,
            env: launch.env.clone(),
        }
    }
}

async fn probe(binary: &Path) -> Result<(), SandboxError> {
    let mut command = Command::new(binary);
    command
        .args(["-p", "(version 1)(allow default)", "/usr/bin/true"])
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
