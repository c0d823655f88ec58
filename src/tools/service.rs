//! ServiceTool (C4.4.6), sysvinit reference adapter. Consults the shared
//! `Changes` accumulator to decide whether a running service needs a
//! restart; `enabled` is applied unconditionally via the runlevel facility.

use std::collections::BTreeMap;

use crate::error::ToolError;
use crate::model::{ChangeCategory, Changes, ServiceSpec};
use crate::process::{run, Invocation, RunOptions};
use crate::tools::ToolContext;

/// manager -> serviceName -> spec. Only the `sysvinit` manager is
/// implemented; others are warned about and skipped.
pub fn apply(
    spec: &BTreeMap<String, BTreeMap<String, ServiceSpec>>,
    changes: &Changes,
    _ctx: &ToolContext<'_>,
) -> Result<Vec<String>, ToolError> {
    let mut restarted = Vec::new();

    for (manager, services) in spec {
        if !manager.eq_ignore_ascii_case("sysvinit") {
            crate::log::warn!("service: unsupported manager {manager:?}, skipping");
            continue;
        }

        for (name, svc) in services {
            if let Some(enabled) = svc.enabled {
                set_enabled(name, enabled)?;
            }

            let Some(true) = svc.ensure_running else {
                continue;
            };

            let depends_changed = changes.contains_any(ChangeCategory::Files, &svc.files)
                || changes.contains_any(ChangeCategory::Sources, &svc.sources)
                || changes.contains_any(ChangeCategory::Commands, &svc.commands)
                || changes.contains_any(ChangeCategory::Packages, &flatten_packages(svc));

            let running = is_running(name)?;

            if !running {
                start(name)?;
                restarted.push(name.clone());
            } else if depends_changed {
                restart(name)?;
                restarted.push(name.clone());
            }
        }
    }

    restarted.sort();
    restarted.dedup();
    Ok(restarted)
}

fn flatten_packages(svc: &ServiceSpec) -> Vec<String> {
    svc.packages.values().flatten().cloned().collect()
}

fn set_enabled(name: &str, enabled: bool) -> Result<(), ToolError> {
    let flag = if enabled { "on" } else { "off" };
    let out = run(
        &Invocation::Argv(vec!["chkconfig".to_string(), name.to_string(), flag.to_string()]),
        RunOptions::default(),
    )
    .map_err(|e| ToolError::new("ServiceTool", format!("chkconfig {name} {flag}: {e}")))?;
    if !out.success() {
        return Err(ToolError::new(
            "ServiceTool",
            format!("chkconfig {name} {flag} failed: {}", out.stderr),
        )
        .with_exit_code(out.exit_code));
    }
    Ok(())
}

fn is_running(name: &str) -> Result<bool, ToolError> {
    let out = run(
        &Invocation::Argv(vec!["service".to_string(), name.to_string(), "status".to_string()]),
        RunOptions::default(),
    )
    .map_err(|e| ToolError::new("ServiceTool", format!("service {name} status: {e}")))?;
    Ok(out.success())
}

fn start(name: &str) -> Result<(), ToolError> {
    run_service_action(name, "start")
}

fn restart(name: &str) -> Result<(), ToolError> {
    run_service_action(name, "restart")
}

fn run_service_action(name: &str, action: &str) -> Result<(), ToolError> {
    let out = run(
        &Invocation::Argv(vec!["service".to_string(), name.to_string(), action.to_string()]),
        RunOptions::default(),
    )
    .map_err(|e| ToolError::new("ServiceTool", format!("service {name} {action}: {e}")))?;
    if !out.success() {
        return Err(ToolError::new(
            "ServiceTool",
            format!("service {name} {action} failed: {}", out.stderr),
        )
        .with_exit_code(out.exit_code));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthRegistry;
    use crate::retry::HttpClient;

    #[test]
    fn unsupported_manager_is_skipped_without_error() {
        let http = HttpClient::default();
        let auth = AuthRegistry::default();
        let ctx = ToolContext { http: &http, auth: &auth };
        let mut spec = BTreeMap::new();
        spec.insert("launchd".to_string(), BTreeMap::new());
        let changes = Changes::new();
        let restarted = apply(&spec, &changes, &ctx).unwrap();
        assert!(restarted.is_empty());
    }

    #[test]
    fn flatten_packages_collects_all_managers() {
        let mut svc = ServiceSpec::default();
        svc.packages.insert("yum".to_string(), vec!["httpd".to_string()]);
        svc.packages.insert("rpm".to_string(), vec!["mod_ssl".to_string()]);
        let mut flat = flatten_packages(&svc);
        flat.sort();
        assert_eq!(flat, vec!["httpd".to_string(), "mod_ssl".to_string()]);
    }
}
