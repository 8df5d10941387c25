//! `{{...}}` substitution for commands, env values and sandbox paths.
//!
//! Two namespaces are understood: `dirs.<name>` (see [`DirectoryKind`]) and
//! `parentEnv.<VAR>`. A parent variable that is not set renders as the empty
//! string; an unknown namespace or directory name is an error.

use std::collections::HashMap;

use thiserror::Error;

use crate::directories::{DirectoryKind, DirectoryResolver};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated template expression in `{template}`")]
    Unterminated { template: String },
    #[error("unknown template variable `{variable}`")]
    UnknownVariable { variable: String },
}

#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub dirs: &'a DirectoryResolver,
    pub parent_env: &'a HashMap<String, String>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(dirs: &'a DirectoryResolver, parent_env: &'a HashMap<String, String>) -> Self {
        Self { dirs, parent_env }
    }

    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            output.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let end = after_open
                .find("}}")
                .ok_or_else(|| TemplateError::Unterminated {
                    template: template.to_string(),
                })?;
            let variable = after_open[..end].trim();
            output.push_str(&self.lookup(variable)?);
            rest = &after_open[end + 2..];
        }

        output.push_str(rest);
        Ok(output)
    }

    fn lookup(&self, variable: &str) -> Result<String, TemplateError> {
        let unknown = || TemplateError::UnknownVariable {
            variable: variable.to_string(),
        };

        let (namespace, name) = variable.split_once('.').ok_or_else(unknown)?;
        match namespace {
            "dirs" => {
                let kind = DirectoryKind::parse(name).ok_or_else(unknown)?;
                Ok(self.dirs.get(kind).to_string_lossy().into_owned())
            }
            "parentEnv" => Ok(self.parent_env.get(name).cloned().unwrap_or_default()),
            _ => Err(unknown()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directories::ExecutionScope;

    fn fixture() -> (DirectoryResolver, HashMap<String, String>) {
        let dirs = DirectoryResolver::from_parts("/r", "/w", ExecutionScope::Project);
        let env = HashMap::from([("TOKEN".to_string(), "s3cret".to_string())]);
        (dirs, env)
    }

    #[test]
    fn renders_dirs_and_parent_env() {
        let (dirs, env) = fixture();
        let ctx = TemplateContext::new(&dirs, &env);
        assert_eq!(
            ctx.render("{{ dirs.workspace }}/data?t={{parentEnv.TOKEN}}").unwrap(),
            "/w/data?t=s3cret"
        );
        assert_eq!(ctx.render("plain").unwrap(), "plain");
        assert_eq!(ctx.render("{{parentEnv.MISSING}}x").unwrap(), "x");
    }

    #[test]
    fn rejects_bad_templates() {
        let (dirs, env) = fixture();
        let ctx = TemplateContext::new(&dirs, &env);
        assert!(matches!(
            ctx.render("{{dirs.home"),
            Err(TemplateError::Unterminated { .. })
        ));
        assert_eq!(
            ctx.render("{{dirs.nowhere}}"),
            Err(TemplateError::UnknownVariable {
                variable: "dirs.nowhere".to_string()
            })
        );
        assert!(ctx.render("{{secret}}").is_err());
    }
}
