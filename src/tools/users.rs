//! UsersTool (C4.4.5): create-if-missing OS users. Existing users are left
//! alone; group membership and uid are only applied at creation time.

use std::collections::BTreeMap;

use crate::error::ToolError;
use crate::model::UserSpec;
use crate::process::{run, Invocation, RunOptions};

/// `userName -> { uid?, groups, homeDir? }`, applied sorted by name.
pub fn apply(spec: &BTreeMap<String, UserSpec>, _ctx: &super::ToolContext<'_>) -> Result<Vec<String>, ToolError> {
    let mut created = Vec::new();

    for (name, user) in spec {
        if user_exists(name)? {
            continue;
        }

        let mut args = vec!["useradd".to_string()];
        if let Some(uid) = user.uid {
            args.push("-u".to_string());
            args.push(uid.to_string());
        }
        if !user.groups.is_empty() {
            args.push("-G".to_string());
            args.push(user.groups.join(","));
        }
        match &user.home_dir {
            Some(dir) => {
                args.push("-d".to_string());
                args.push(dir.clone());
            }
            None => args.push("-M".to_string()),
        }
        args.push("-s".to_string());
        args.push("/sbin/nologin".to_string());
        args.push(name.clone());

        let out = run(&Invocation::Argv(args), RunOptions::default())
            .map_err(|e| ToolError::new("UsersTool", format!("useradd {name}: {e}")))?;
        if !out.success() {
            return Err(ToolError::new("UsersTool", format!("useradd {name} failed: {}", out.stderr))
                .with_exit_code(out.exit_code));
        }
        created.push(name.clone());
    }

    created.sort();
    Ok(created)
}

fn user_exists(name: &str) -> Result<bool, ToolError> {
    let out = run(
        &Invocation::Argv(vec!["getent".to_string(), "passwd".to_string(), name.to_string()]),
        RunOptions::default(),
    )
    .map_err(|e| ToolError::new("UsersTool", format!("getent passwd {name}: {e}")))?;
    Ok(out.success())
}
