//! GroupsTool (C4.4.3): create-if-missing OS groups. Never modifies an
//! existing group's gid; an explicit gid is only honoured at creation time.

use std::collections::BTreeMap;

use crate::error::ToolError;
use crate::model::GroupSpec;
use crate::process::{run, Invocation, RunOptions};

/// `groupName -> { gid? }`, applied sorted by name.
pub fn apply(spec: &BTreeMap<String, GroupSpec>, _ctx: &super::ToolContext<'_>) -> Result<Vec<String>, ToolError> {
    let mut created = Vec::new();

    for (name, group) in spec {
        if group_exists(name)? {
            continue;
        }

        let mut args = vec!["groupadd".to_string()];
        if let Some(gid) = group.gid {
            args.push("-g".to_string());
            args.push(gid.to_string());
        }
        args.push(name.clone());

        let out = run(&Invocation::Argv(args), RunOptions::default())
            .map_err(|e| ToolError::new("GroupsTool", format!("groupadd {name}: {e}")))?;
        if !out.success() {
            return Err(ToolError::new("GroupsTool", format!("groupadd {name} failed: {}", out.stderr))
                .with_exit_code(out.exit_code));
        }
        created.push(name.clone());
    }

    created.sort();
    Ok(created)
}

fn group_exists(name: &str) -> Result<bool, ToolError> {
    let out = run(
        &Invocation::Argv(vec!["getent".to_string(), "group".to_string(), name.to_string()]),
        RunOptions::default(),
    )
    .map_err(|e| ToolError::new("GroupsTool", format!("getent group {name}: {e}")))?;
    Ok(out.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthRegistry;
    use crate::retry::HttpClient;
    use crate::tools::ToolContext;

    #[test]
    fn empty_spec_creates_nothing() {
        let http = HttpClient::default();
        let auth = AuthRegistry::default();
        let ctx = ToolContext { http: &http, auth: &auth };
        let spec = BTreeMap::new();
        let changed = apply(&spec, &ctx).unwrap();
        assert!(changed.is_empty());
    }
}
