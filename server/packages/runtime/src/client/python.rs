use tracing::Span;

use super::shell::script_for;
use super::{delegate_to_shell, ClientContext, ClientError, ShellClient, ShellLaunch};
use crate::config::{PythonPackage, ServerConfig};
use crate::sandbox::ExtraPaths;

/// `uvx [--python V] --from <package>==<version> <command|package> <args...>`
pub fn uvx_command(package: &PythonPackage) -> Vec<String> {
    let mut words = vec!["uvx".to_string()];
    if let Some(python) = &package.python_version {
        words.push("--python".to_string());
        words.push(python.clone());
    }
    words.push("--from".to_string());
    words.push(format!("{}=={}", package.package, package.version));
    words.push(
        package
            .command
            .clone()
            .unwrap_or_else(|| package.package.clone()),
    );
    words.extend(package.args.iter().cloned());
    words
}

/// Runs a pinned Python package through `uvx`.
#[derive(Debug)]
pub struct PythonClient {
    inner: ShellClient,
}

impl PythonClient {
    pub fn new(
        config: &ServerConfig,
        package: &PythonPackage,
        ctx: &ClientContext,
        span: Span,
    ) -> Result<Self, ClientError> {
        let templates = ctx.templates();
        let args = package
            .args
            .iter()
            .map(|arg| templates.render(arg))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| ClientError::config(&config.name, err))?;
        let words = uvx_command(&PythonPackage {
            args,
            ..package.clone()
        });

        let launch = ShellLaunch {
            server: config.name.clone(),
            command: script_for(&words, ctx.platform),
            cwd: ctx.dirs.workspace().to_path_buf(),
            env: ctx.resolve_env(config)?,
            sandbox: ctx.finalize_sandbox(config)?,
            extra: ExtraPaths {
                read: Vec::new(),
                read_write: vec![ctx.dirs.cache().join("uv")],
            },
        };
        Ok(Self {
            inner: ShellClient::new(launch, ctx, span),
        })
    }

    pub fn launch(&self) -> &ShellLaunch {
        self.inner.launch()
    }
}

delegate_to_shell!(PythonClient);
