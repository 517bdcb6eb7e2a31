//! Shell script generation
//!
//! Maps a build stage to executable script text. The generated script
//! exports the stage's variables, moves into the workspace, and echoes each
//! command before running it, so the trace reads like an interactive session.

use std::fmt::Write as _;
use std::path::Path;

use crate::trace::{ANSI_BOLD_GREEN, ANSI_RESET};

/// Input for script generation
pub struct ScriptInfo<'a> {
    pub script_lines: &'a [String],
    pub build_dir: &'a Path,
}

/// Maps a stage to script text for one shell dialect
pub trait ShellScripter: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate(&self, info: &ScriptInfo<'_>) -> String;
}

/// Scripter for the shell named in the runner config.
pub fn scripter_for(name: &str) -> Option<Box<dyn ShellScripter>> {
    match name {
        "bash" | "sh" => Some(Box::new(BashScripter)),
        _ => None,
    }
}

pub struct BashScripter;

impl ShellScripter for BashScripter {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn generate(&self, info: &ScriptInfo<'_>) -> String {
        let mut script = String::new();
        script.push_str("set -eo pipefail\n");
        script.push_str("set +o noclobber\n");

        let _ = writeln!(script, "cd {}", quote(&info.build_dir.to_string_lossy()));

        for line in info.script_lines {
            // print the command the way a prompt would, then run it
            let _ = writeln!(
                script,
                "echo {}",
                quote(&format!("{}$ {}{}", ANSI_BOLD_GREEN, line, ANSI_RESET))
            );
            script.push_str(line);
            script.push('\n');
        }

        script
    }
}

/// Single-quote `s` for POSIX shells.
pub fn quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    if s
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'/' | b':' | b'@' | b'%' | b'+' | b'='))
    {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_quote_passthrough_for_safe_strings() {
        assert_eq!(quote("plain-value_1.0/x"), "plain-value_1.0/x");
        assert_eq!(quote("a:b@c%d+e=f"), "a:b@c%d+e=f");
    }

    #[test]
    fn test_quote_empty_and_spaces() {
        assert_eq!(quote(""), "''");
        assert_eq!(quote("two words"), "'two words'");
        assert_eq!(quote("a$b"), "'a$b'");
    }

    #[test]
    fn test_quote_single_quotes() {
        assert_eq!(quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_bash_script_shape() {
        let lines = vec!["make build".to_string(), "make test".to_string()];
        let info = ScriptInfo {
            script_lines: &lines,
            build_dir: &PathBuf::from("/builds/job-1"),
        };

        let script = BashScripter.generate(&info);
        assert!(script.starts_with("set -eo pipefail\n"));
        assert!(script.contains("cd /builds/job-1\n"));
        assert!(script.contains("make build\n"));
        assert!(script.contains("make test\n"));
        // every command is echoed before execution
        assert_eq!(script.matches("echo ").count(), 2);
    }

    #[test]
    fn test_scripter_lookup() {
        assert!(scripter_for("bash").is_some());
        assert!(scripter_for("sh").is_some());
        assert!(scripter_for("powershell").is_none());
    }
}
