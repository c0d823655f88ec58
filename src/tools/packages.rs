//! Package managers (YumTool / RpmTool / AptTool / PythonTool / GemTool).
//!
//! Each manager probes "already installed?" and "available?" before
//! issuing one batched install command, so a fully-satisfied package list
//! is idempotent (empty changed-set) per spec.md §4.4.1.

use std::collections::BTreeMap;

use crate::error::ToolError;
use crate::model::VersionSpec;
use crate::process::{run, Invocation, RunOptions};
use crate::tools::{order_managers, ToolContext};

/// manager -> (pkgName -> versionSpec), run in the fixed ordering from
/// [`order_managers`].
pub fn apply(
    spec: &BTreeMap<String, BTreeMap<String, VersionSpec>>,
    ctx: &ToolContext<'_>,
) -> Result<Vec<String>, ToolError> {
    let mut changed = Vec::new();
    for manager in order_managers(spec.keys().cloned()) {
        let pkgs = &spec[&manager];
        let mgr_changed = match manager.to_lowercase().as_str() {
            "yum" => yum_apply(pkgs)?,
            "rpm" => rpm_apply(pkgs, ctx)?,
            "apt" | "dpkg" => apt_apply(pkgs)?,
            "python" => python_apply(pkgs)?,
            "rubygems" | "gem" => gem_apply(pkgs)?,
            other => {
                crate::log::warn!("packages: unsupported manager {other:?}, skipping");
                Vec::new()
            }
        };
        changed.extend(mgr_changed);
    }
    Ok(changed)
}

fn argv(cmd: &[&str]) -> Invocation {
    Invocation::Argv(cmd.iter().map(|s| s.to_string()).collect())
}

fn spec_to_strings(name: &str, spec: &VersionSpec) -> Vec<String> {
    spec.versions()
        .into_iter()
        .map(|v| match v {
            Some(v) => format!("{name}-{v}"),
            None => name.to_string(),
        })
        .collect()
}

/// `Yum`: `makecache`, then classify each `pkgName-version` via
/// `list installed`/`list available -C -y`, then one batched `-y install`.
fn yum_apply(pkgs: &BTreeMap<String, VersionSpec>) -> Result<Vec<String>, ToolError> {
    run(&argv(&["yum", "makecache"]), RunOptions::default())
        .map_err(|e| ToolError::new("YumTool", format!("makecache: {e}")))?;

    let mut to_install = Vec::new();
    let mut changed = Vec::new();

    for (name, spec) in pkgs {
        for candidate in spec_to_strings(name, spec) {
            let installed = run(
                &argv(&["yum", "-C", "-y", "list", "installed", &candidate]),
                RunOptions::default(),
            )
            .map_err(|e| ToolError::new("YumTool", format!("list installed {candidate}: {e}")))?
            .success();

            if installed {
                continue;
            }

            let available = run(
                &argv(&["yum", "-C", "-y", "list", "available", &candidate]),
                RunOptions::default(),
            )
            .map_err(|e| ToolError::new("YumTool", format!("list available {candidate}: {e}")))?
            .success();

            if !available {
                return Err(ToolError::new(
                    "YumTool",
                    format!("package {candidate} is not available"),
                ));
            }

            to_install.push(candidate);
            changed.push(name.clone());
        }
    }

    if !to_install.is_empty() {
        let mut cmd = vec!["yum".to_string(), "-y".to_string(), "install".to_string()];
        cmd.extend(to_install);
        let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
        let out = run(&argv(&args), RunOptions::default())
            .map_err(|e| ToolError::new("YumTool", format!("install: {e}")))?;
        if !out.success() {
            return Err(ToolError::new("YumTool", format!("yum install failed: {}", out.stderr))
                .with_exit_code(out.exit_code));
        }
    }

    changed.sort();
    changed.dedup();
    Ok(changed)
}

/// `Rpm`: each `pkgs` value is a URL or local path. Determines the
/// name-version-release.arch via `rpm -qp --queryformat`, skips if
/// `rpm -q --quiet` already satisfies it, else batches
/// `rpm -U --quiet --nosignature --replacepkgs`.
fn rpm_apply(
    pkgs: &BTreeMap<String, VersionSpec>,
    ctx: &ToolContext<'_>,
) -> Result<Vec<String>, ToolError> {
    let mut local_paths = Vec::new();
    let mut changed = Vec::new();

    for (name, spec) in pkgs {
        for location in spec.versions().into_iter().flatten() {
            let local_path = if location.starts_with("http") || location.starts_with("ftp") {
                let dest = std::env::temp_dir().join(format!(
                    "stack-init-rpm-{}.rpm",
                    name.replace(['/', ' '], "_")
                ));
                ctx.http
                    .get_to_file(location, &dest, None)
                    .map_err(|e| ToolError::new("RpmTool", format!("download {location}: {e}")))?;
                dest
            } else {
                std::path::PathBuf::from(location)
            };

            let nvra = run(
                &argv(&[
                    "rpm",
                    "-qp",
                    "--queryformat",
                    "%{NAME}-%{VERSION}-%{RELEASE}.%{ARCH}",
                    local_path.to_str().unwrap_or_default(),
                ]),
                RunOptions::default(),
            )
            .map_err(|e| ToolError::new("RpmTool", format!("queryformat {name}: {e}")))?;
            if !nvra.success() {
                return Err(ToolError::new(
                    "RpmTool",
                    format!("cannot inspect package {name}: {}", nvra.stderr),
                ));
            }
            let nvra = nvra.stdout.trim().to_string();

            let already_installed = run(&argv(&["rpm", "-q", "--quiet", &nvra]), RunOptions::default())
                .map_err(|e| ToolError::new("RpmTool", format!("query {nvra}: {e}")))?
                .success();

            if already_installed {
                continue;
            }

            local_paths.push(local_path.to_string_lossy().to_string());
            changed.push(name.clone());
        }
    }

    if !local_paths.is_empty() {
        let mut cmd = vec![
            "rpm".to_string(),
            "-U".to_string(),
            "--quiet".to_string(),
            "--nosignature".to_string(),
            "--replacepkgs".to_string(),
        ];
        cmd.extend(local_paths);
        let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
        let out = run(&argv(&args), RunOptions::default())
            .map_err(|e| ToolError::new("RpmTool", format!("install: {e}")))?;
        if !out.success() {
            return Err(ToolError::new("RpmTool", format!("rpm -U failed: {}", out.stderr))
                .with_exit_code(out.exit_code));
        }
    }

    changed.sort();
    changed.dedup();
    Ok(changed)
}

fn apt_apply(pkgs: &BTreeMap<String, VersionSpec>) -> Result<Vec<String>, ToolError> {
    let mut to_install = Vec::new();
    let mut changed = Vec::new();

    for (name, spec) in pkgs {
        for candidate in spec_to_strings(name, spec) {
            let installed = run(&argv(&["dpkg", "-s", &candidate]), RunOptions::default())
                .map_err(|e| ToolError::new("AptTool", format!("dpkg -s {candidate}: {e}")))?
                .success();
            if !installed {
                to_install.push(candidate);
                changed.push(name.clone());
            }
        }
    }

    if !to_install.is_empty() {
        let mut cmd = vec!["apt-get".to_string(), "install".to_string(), "-y".to_string()];
        cmd.extend(to_install);
        let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
        let out = run(&argv(&args), RunOptions::default())
            .map_err(|e| ToolError::new("AptTool", format!("install: {e}")))?;
        if !out.success() {
            return Err(ToolError::new("AptTool", format!("apt-get install failed: {}", out.stderr))
                .with_exit_code(out.exit_code));
        }
    }

    changed.sort();
    changed.dedup();
    Ok(changed)
}

fn python_apply(pkgs: &BTreeMap<String, VersionSpec>) -> Result<Vec<String>, ToolError> {
    let mut changed = Vec::new();
    for (name, spec) in pkgs {
        for version in spec.versions() {
            let requirement = match version {
                Some(v) => format!("{name}=={v}"),
                None => name.clone(),
            };
            let installed = run(&argv(&["pip", "show", name]), RunOptions::default())
                .map_err(|e| ToolError::new("PythonTool", format!("pip show {name}: {e}")))?
                .success();
            if installed {
                continue;
            }
            let out = run(&argv(&["pip", "install", &requirement]), RunOptions::default())
                .map_err(|e| ToolError::new("PythonTool", format!("pip install {requirement}: {e}")))?;
            if !out.success() {
                return Err(ToolError::new(
                    "PythonTool",
                    format!("pip install {requirement} failed: {}", out.stderr),
                )
                .with_exit_code(out.exit_code));
            }
            changed.push(name.clone());
        }
    }
    changed.sort();
    changed.dedup();
    Ok(changed)
}

fn gem_apply(pkgs: &BTreeMap<String, VersionSpec>) -> Result<Vec<String>, ToolError> {
    let mut changed = Vec::new();
    for (name, spec) in pkgs {
        for version in spec.versions() {
            let mut list_args = vec!["gem", "list", "-i", name];
            if let Some(v) = version {
                list_args.push("-v");
                list_args.push(v);
            }
            let installed = run(&argv(&list_args), RunOptions::default())
                .map_err(|e| ToolError::new("GemTool", format!("gem list {name}: {e}")))?
                .success();
            if installed {
                continue;
            }

            let mut install_args = vec!["gem".to_string(), "install".to_string(), name.clone()];
            if let Some(v) = version {
                install_args.push("-v".to_string());
                install_args.push(v.to_string());
            }
            let args: Vec<&str> = install_args.iter().map(String::as_str).collect();
            let out = run(&argv(&args), RunOptions::default())
                .map_err(|e| ToolError::new("GemTool", format!("gem install {name}: {e}")))?;
            if !out.success() {
                return Err(ToolError::new("GemTool", format!("gem install {name} failed: {}", out.stderr))
                    .with_exit_code(out.exit_code));
            }
            changed.push(name.clone());
        }
    }
    changed.sort();
    changed.dedup();
    Ok(changed)
}
