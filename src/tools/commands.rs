//! CommandTool (C4.4.4): runs commands in lexical name order, gated by an
//! optional test command, raising on non-zero exit unless `ignoreErrors`.

use std::collections::BTreeMap;

use crate::error::ToolError;
use crate::model::{CommandLine, CommandSpec};
use crate::process::{run, Invocation, RunOptions};

/// `name -> {command, cwd?, env?, test?, ignoreErrors?}`, run in the
/// lexical (stable-sorted) order of `name`.
pub fn apply(spec: &BTreeMap<String, CommandSpec>) -> Result<Vec<String>, ToolError> {
    let mut ran = Vec::new();

    for (name, command) in spec {
        if let Some(test) = &command.test {
            let test_out = run(
                &Invocation::Shell(test.clone()),
                RunOptions {
                    env: command.env.as_ref(),
                    cwd: command.cwd.as_deref().map(std::path::Path::new),
                    ..Default::default()
                },
            )
            .map_err(|e| ToolError::new("CommandTool", format!("test for {name}: {e}")))?;

            if !test_out.success() {
                continue;
            }
        }

        let invocation = match &command.command {
            CommandLine::Shell(s) => Invocation::Shell(s.clone()),
            CommandLine::Argv(argv) => Invocation::Argv(argv.clone()),
        };

        let out = run(
            &invocation,
            RunOptions {
                env: command.env.as_ref(),
                cwd: command.cwd.as_deref().map(std::path::Path::new),
                ..Default::default()
            },
        )
        .map_err(|e| ToolError::new("CommandTool", format!("running {name}: {e}")))?;

        if !out.success() && !command.ignore_errors {
            return Err(ToolError::new("CommandTool", format!("command {name} failed: {}", out.stderr))
                .with_exit_code(out.exit_code));
        }

        ran.push(name.clone());
    }

    Ok(ran)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_run_in_lexical_order() {
        let mut spec = BTreeMap::new();
        spec.insert(
            "20-second".to_string(),
            CommandSpec {
                command: CommandLine::Shell("exit 0".to_string()),
                cwd: None,
                env: None,
                test: None,
                ignore_errors: false,
            },
        );
        spec.insert(
            "10-first".to_string(),
            CommandSpec {
                command: CommandLine::Shell("exit 0".to_string()),
                cwd: None,
                env: None,
                test: None,
                ignore_errors: false,
            },
        );
        let ran = apply(&spec).unwrap();
        assert_eq!(ran, vec!["10-first".to_string(), "20-second".to_string()]);
    }

    #[test]
    fn failing_test_skips_command() {
        let mut spec = BTreeMap::new();
        spec.insert(
            "cmd".to_string(),
            CommandSpec {
                command: CommandLine::Shell("exit 1".to_string()),
                cwd: None,
                env: None,
                test: Some("exit 1".to_string()),
                ignore_errors: false,
            },
        );
        let ran = apply(&spec).unwrap();
        assert!(ran.is_empty());
    }

    #[test]
    fn failing_command_raises_unless_ignored() {
        let mut spec = BTreeMap::new();
        spec.insert(
            "cmd".to_string(),
            CommandSpec {
                command: CommandLine::Shell("exit 3".to_string()),
                cwd: None,
                env: None,
                test: None,
                ignore_errors: false,
            },
        );
        assert!(apply(&spec).is_err());

        spec.get_mut("cmd").unwrap().ignore_errors = true;
        let ran = apply(&spec).unwrap();
        assert_eq!(ran, vec!["cmd".to_string()]);
    }
}
