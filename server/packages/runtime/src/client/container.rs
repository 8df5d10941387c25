use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::Span;

use super::shell::script_for;
use super::{delegate_to_shell, ClientContext, ClientError, ShellClient, ShellLaunch};
use crate::config::{ContainerImage, ServerConfig};
use crate::sandbox::ExtraPaths;

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// `docker run --rm -i --init [--env KEY ...] [-v host:container[:ro] ...]
/// <image>:<tag> [command...]`
///
/// Only variable names reach the command line; values travel in the docker
/// CLI's own environment.
pub fn docker_command(image: &ContainerImage, env: &BTreeMap<String, String>) -> Vec<String> {
    let mut words: Vec<String> = ["docker", "run", "--rm", "-i", "--init"]
        .into_iter()
        .map(String::from)
        .collect();
    for key in env.keys() {
        words.push("--env".to_string());
        words.push(key.clone());
    }
    for volume in &image.volumes {
        words.push("-v".to_string());
        let mut spec = format!("{}:{}", volume.host, volume.container);
        if volume.read_only {
            spec.push_str(":ro");
        }
        words.push(spec);
    }
    words.push(format!("{}:{}", image.image, image.tag));
    words.extend(image.command.iter().cloned());
    words
}

/// Runs a pinned container image through the docker CLI.
#[derive(Debug)]
pub struct ContainerClient {
    inner: ShellClient,
}

impl ContainerClient {
    pub fn new(
        config: &ServerConfig,
        image: &ContainerImage,
        ctx: &ClientContext,
        span: Span,
    ) -> Result<Self, ClientError> {
        let templates = ctx.templates();
        let workspace = ctx.dirs.workspace();
        let mut resolved = image.clone();
        for volume in &mut resolved.volumes {
            let host = templates
                .render(&volume.host)
                .map_err(|err| ClientError::config(&config.name, err))?;
            volume.host = absolute(&host, workspace).to_string_lossy().into_owned();
        }

        let env = ctx.resolve_env(config)?;
        let words = docker_command(&resolved, &env);

        let launch = ShellLaunch {
            server: config.name.clone(),
            command: script_for(&words, ctx.platform),
            cwd: workspace.to_path_buf(),
            env,
            sandbox: ctx.finalize_sandbox(config)?,
            extra: ExtraPaths {
                read: Vec::new(),
                read_write: vec![docker_socket(&ctx.parent_env)],
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

delegate_to_shell!(ContainerClient);

fn absolute(path: &str, workspace: &Path) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        workspace.join(path)
    }
}

/// The daemon socket the CLI talks to: `DOCKER_HOST` when it names a unix
/// socket, the default socket otherwise.
fn docker_socket(parent_env: &HashMap<String, String>) -> PathBuf {
    parent_env
        .get("DOCKER_HOST")
        .and_then(|host| host.strip_prefix("unix://"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DOCKER_SOCKET))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContainerVolume, RuntimeTunables, ServerRuntime};
    use crate::directories::{DirectoryResolver, ExecutionScope};
    use crate::sandbox::Platform;
    use serde_json::json;

    #[test]
    fn env_names_only_and_volume_modes() {
        let image = ContainerImage {
            image: "ghcr.io/acme/db-mcp".to_string(),
            tag: "v2".to_string(),
            command: vec!["serve".to_string(), "--stdio".to_string()],
            volumes: vec![
                ContainerVolume {
                    host: "/data".to_string(),
                    container: "/data".to_string(),
                    read_only: true,
                },
                ContainerVolume {
                    host: "/scratch".to_string(),
                    container: "/tmp/scratch".to_string(),
                    read_only: false,
                },
            ],
        };
        let env = BTreeMap::from([("API_TOKEN".to_string(), "secret".to_string())]);
        let words = docker_command(&image, &env);

        assert_eq!(
            words,
            [
                "docker",
                "run",
                "--rm",
                "-i",
                "--init",
                "--env",
                "API_TOKEN",
                "-v",
                "/data:/data:ro",
                "-v",
                "/scratch:/tmp/scratch",
                "ghcr.io/acme/db-mcp:v2",
                "serve",
                "--stdio"
            ]
        );
        assert!(!words.iter().any(|word| word.contains("secret")));
    }

    #[test]
    fn relative_volumes_resolve_against_workspace() {
        let dirs = DirectoryResolver::from_parts("/r", "/w", ExecutionScope::Project);
        let mut ctx = ClientContext::new(dirs, RuntimeTunables::default()).with_parent_env(
            HashMap::from([("DOCKER_HOST".to_string(), "unix:///run/user/1000/docker.sock".to_string())]),
        );
        ctx.platform = Platform::Linux;

        let config: ServerConfig = serde_json::from_value(json!({
            "name": "db",
            "container": {
                "image": "acme/db",
                "tag": "1",
                "volumes": [{"host": "data", "container": "/data"}]
            },
            "env": {"TOKEN": {"string": "abc"}}
        }))
        .unwrap();
        let ServerRuntime::Container(image) = &config.runtime else {
            unreachable!()
        };
        let client = ContainerClient::new(&config, image, &ctx, Span::none()).unwrap();

        let launch = client.launch();
        assert_eq!(
            launch.command,
            "exec docker run --rm -i --init --env TOKEN -v /w/data:/data acme/db:1"
        );
        assert_eq!(launch.env["TOKEN"], "abc");
        assert_eq!(
            launch.extra.read_write,
            vec![PathBuf::from("/run/user/1000/docker.sock")]
        );
    }
}
