use tracing::Span;

use super::shell::script_for;
use super::{delegate_to_shell, ClientContext, ClientError, ShellClient, ShellLaunch};
use crate::config::{NodePackage, ServerConfig};
use crate::sandbox::ExtraPaths;

/// `npx -y <package>@<version> <args...>`
pub fn npx_command(package: &NodePackage) -> Vec<String> {
    let mut words = vec![
        "npx".to_string(),
        "-y".to_string(),
        format!("{}@{}", package.package, package.version),
    ];
    words.extend(package.args.iter().cloned());
    words
}

/// Runs a pinned npm package through `npx`.
#[derive(Debug)]
pub struct NodeClient {
    inner: ShellClient,
}

impl NodeClient {
    pub fn new(
        config: &ServerConfig,
        package: &NodePackage,
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
        let words = npx_command(&NodePackage {
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
                read_write: vec![ctx.dirs.home().join(".npm")],
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

delegate_to_shell!(NodeClient);
