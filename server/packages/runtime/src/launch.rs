use std::collections::BTreeMap;
use std::path::PathBuf;

/// A concrete program invocation, before or after sandbox wrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Program and arguments as one vector, program first.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.to_string_lossy().into_owned());
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn display(&self) -> String {
        format_command_for_display(&self.program, &self.args)
    }
}

pub fn format_command_for_display(program: &std::path::Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(program.to_string_lossy().as_ref()));
    for arg in args {
        parts.push(shell_quote(arg));
    }
    parts.join(" ")
}

/// POSIX single-quote quoting; words made only of safe characters are left
/// bare so generated scripts stay readable.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c));
    if safe {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// `cmd.exe` quoting for generated batch scripts.
pub fn cmd_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@+=:,./\\_-".contains(c));
    if safe {
        return value.to_string();
    }
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Joins words into one command line for the given platform's shell.
pub fn join_command_line(words: &[String], windows: bool) -> String {
    words
        .iter()
        .map(|word| if windows { cmd_quote(word) } else { shell_quote(word) })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_leaves_safe_words_bare() {
        assert_eq!(shell_quote("@scope/pkg@1.0.0"), "@scope/pkg@1.0.0");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(cmd_quote("C:\\tools\\x.exe"), "C:\\tools\\x.exe");
        assert_eq!(cmd_quote("a \"b\""), "\"a \"\"b\"\"\"");
    }

    #[test]
    fn display_quotes_program_and_args() {
        let spec = LaunchSpec::new("/usr/bin/env", vec!["A=1".to_string(), "echo hi".to_string()]);
        assert_eq!(spec.display(), "/usr/bin/env A=1 'echo hi'");
        assert_eq!(spec.argv()[0], "/usr/bin/env");
    }
}
