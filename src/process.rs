//! Process runner (C3): synchronous subprocess invocation with captured
//! output, matching `connector_git.rs`'s direct use of `std::process::Command`
//! generalized into a small reusable contract.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

/// Either a shell string (passed to the system shell) or an argv sequence
/// (executed directly, no shell interpretation).
#[derive(Debug, Clone)]
pub enum Invocation {
    Shell(String),
    Argv(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions<'a> {
    pub env: Option<&'a HashMap<String, String>>,
    pub cwd: Option<&'a Path>,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout with stderr appended, for callers that asked for merged output.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}{}", self.stdout, self.stderr)
        }
    }
}

/// Runs `invocation` to completion, capturing output by default. Never
/// raises on a non-zero exit; callers inspect [`RunOutput::exit_code`].
pub fn run(invocation: &Invocation, options: RunOptions<'_>) -> std::io::Result<RunOutput> {
    let mut command = match invocation {
        Invocation::Shell(s) => {
            let mut c = Command::new(shell());
            c.arg(shell_flag()).arg(s);
            c
        }
        Invocation::Argv(argv) => {
            let mut iter = argv.iter();
            let program = iter
                .next()
                .expect("Argv invocation must have at least a program name");
            let mut c = Command::new(program);
            c.args(iter);
            c
        }
    };

    if let Some(env) = options.env {
        for (k, v) in env {
            command.env(k, v);
        }
    }
    if let Some(cwd) = options.cwd {
        command.current_dir(cwd);
    }

    let output = command.output()?;
    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    Ok(RunOutput {
        exit_code,
        stdout,
        stderr,
    })
}

#[cfg(unix)]
fn shell() -> &'static str {
    "/bin/sh"
}

#[cfg(unix)]
fn shell_flag() -> &'static str {
    "-c"
}

#[cfg(windows)]
fn shell() -> &'static str {
    "cmd"
}

#[cfg(windows)]
fn shell_flag() -> &'static str {
    "/C"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_invocation_runs() {
        let out = run(&Invocation::Shell("exit 0".to_string()), RunOptions::default()).unwrap();
        assert!(out.success());
    }

    #[test]
    fn argv_invocation_does_not_use_shell() {
        let out = run(&Invocation::Argv(vec!["/bin/echo".to_string(), "hi".to_string()]), RunOptions::default()).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[test]
    fn non_zero_exit_does_not_raise() {
        let out = run(&Invocation::Shell("exit 7".to_string()), RunOptions::default()).unwrap();
        assert_eq!(out.exit_code, 7);
    }
}
