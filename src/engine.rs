//! Construction engine (C5): resolves `configSet` references into flat,
//! ordered lists of config names (Kahn's topological sort over the
//! reference graph), then drives the Carpenter — tools firing in the
//! fixed order packages -> groups -> users -> sources -> files ->
//! commands -> services — accumulating `Changes` across every config in
//! every requested configSet.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{BuildContext, BuildError};
use crate::model::{ChangeCategory, Changes, ConfigDefinition, ConfigSetDef, ConfigSetElement, InitSection, Model};
use crate::tools::{commands, files, groups, packages, service, sources, users, ToolContext};

/// `build(configSetNames) -> Changes`. Fails fast: the first tool error
/// aborts the whole invocation, no rollback.
pub fn build(model: &Model, config_set_names: &[String], ctx: &ToolContext<'_>) -> Result<Changes, BuildError> {
    let resolved = flatten_config_sets(&model.init)?;
    let mut changes = Changes::new();

    for set_name in config_set_names {
        let config_names = resolved
            .get(set_name)
            .ok_or_else(|| BuildError::NoSuchConfigSet(set_name.clone()))?;

        for config_name in config_names {
            let config = model
                .init
                .configs
                .get(config_name)
                .ok_or_else(|| BuildError::NoSuchConfig(config_name.clone()))?;
            run_carpenter(set_name, config, ctx, &mut changes)?;
        }
    }

    Ok(changes)
}

fn run_carpenter(
    set_name: &str,
    config: &ConfigDefinition,
    ctx: &ToolContext<'_>,
    changes: &mut Changes,
) -> Result<(), BuildError> {
    let frame = |tool: &str| BuildContext {
        config_set: Some(set_name.to_string()),
        config: Some(config.name.clone()),
        tool: Some(tool.to_string()),
        command: None,
    };

    let pkgs = packages::apply(&config.packages, ctx)
        .map_err(|source| BuildError::Tool { context: frame("PackagesTool"), source })?;
    changes.record(ChangeCategory::Packages, pkgs);

    let grps = groups::apply(&config.groups, ctx)
        .map_err(|source| BuildError::Tool { context: frame("GroupsTool"), source })?;
    changes.record(ChangeCategory::Groups, grps);

    let usrs = users::apply(&config.users, ctx)
        .map_err(|source| BuildError::Tool { context: frame("UsersTool"), source })?;
    changes.record(ChangeCategory::Users, usrs);

    let srcs = sources::apply(&config.sources, ctx)
        .map_err(|source| BuildError::Tool { context: frame("SourcesTool"), source })?;
    changes.record(ChangeCategory::Sources, srcs);

    let fls = files::apply(&config.files, ctx)
        .map_err(|source| BuildError::Tool { context: frame("FileTool"), source })?;
    changes.record(ChangeCategory::Files, fls);

    let cmds = commands::apply(&config.commands)
        .map_err(|source| BuildError::Tool { context: frame("CommandTool"), source })?;
    changes.record(ChangeCategory::Commands, cmds);

    service::apply(&config.services, changes, ctx)
        .map_err(|source| BuildError::Tool { context: frame("ServiceTool"), source })?;

    Ok(())
}

/// Collapses every `configSet` into a flat, ordered list of config names,
/// substituting each reference with the target's already-collapsed list.
fn flatten_config_sets(init: &InitSection) -> Result<BTreeMap<String, Vec<String>>, BuildError> {
    let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, def) in &init.config_sets {
        let mut refs = BTreeSet::new();
        collect_refs(def, &mut refs);
        for r in &refs {
            if !init.config_sets.contains_key(r) {
                return Err(BuildError::NoSuchConfigSet(r.clone()));
            }
        }
        deps.insert(name.clone(), refs);
    }

    let mut pending: BTreeMap<String, usize> = deps.iter().map(|(k, v)| (k.clone(), v.len())).collect();
    let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, refs) in &deps {
        for r in refs {
            dependents.entry(r.clone()).or_default().push(name.clone());
        }
    }

    let mut queue: VecDeque<String> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| name.clone())
        .collect();

    if queue.is_empty() && !deps.is_empty() {
        return Err(BuildError::CircularConfigSetDependency(deps.keys().cloned().collect()));
    }

    let mut resolved: BTreeMap<String, Vec<String>> = BTreeMap::new();

    while let Some(name) = queue.pop_front() {
        let def = &init.config_sets[&name];
        let flat = expand(def, &resolved)?;
        resolved.insert(name.clone(), flat);

        if let Some(dependers) = dependents.get(&name) {
            for d in dependers {
                let count = pending.get_mut(d).expect("dependent tracked in pending map");
                *count -= 1;
                if *count == 0 {
                    queue.push_back(d.clone());
                }
            }
        }
    }

    if resolved.len() != deps.len() {
        let remainder: Vec<String> = deps.keys().filter(|k| !resolved.contains_key(*k)).cloned().collect();
        return Err(BuildError::CircularConfigSetDependency(remainder));
    }

    Ok(resolved)
}

fn collect_refs(def: &ConfigSetDef, out: &mut BTreeSet<String>) {
    for element in def {
        match element {
            ConfigSetElement::Config(_) => {}
            ConfigSetElement::SetRef(name) => {
                out.insert(name.clone());
            }
            ConfigSetElement::List(items) => collect_refs(items, out),
        }
    }
}

fn expand(def: &ConfigSetDef, resolved: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>, BuildError> {
    let mut out = Vec::new();
    expand_into(def, resolved, &mut out)?;
    Ok(out)
}

fn expand_into(
    def: &ConfigSetDef,
    resolved: &BTreeMap<String, Vec<String>>,
    out: &mut Vec<String>,
) -> Result<(), BuildError> {
    for element in def {
        match element {
            ConfigSetElement::Config(name) => out.push(name.clone()),
            ConfigSetElement::SetRef(name) => {
                let flat = resolved
                    .get(name)
                    .ok_or_else(|| BuildError::NoSuchConfigSet(name.clone()))?;
                out.extend(flat.iter().cloned());
            }
            ConfigSetElement::List(items) => expand_into(items, resolved, out)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_with(sets: &[(&str, ConfigSetDef)]) -> InitSection {
        let mut init = InitSection::default();
        for (name, def) in sets {
            init.config_sets.insert(name.to_string(), def.clone());
        }
        init
    }

    #[test]
    fn single_config_set_resolves_to_its_own_configs() {
        let init = init_with(&[("default", vec![ConfigSetElement::Config("config".to_string())])]);
        let resolved = flatten_config_sets(&init).unwrap();
        assert_eq!(resolved["default"], vec!["config".to_string()]);
    }

    #[test]
    fn ref_in_place_expands_target_before_trailing_elements() {
        let init = init_with(&[
            ("A", vec![ConfigSetElement::SetRef("B".to_string()), ConfigSetElement::Config("c2".to_string())]),
            ("B", vec![ConfigSetElement::Config("c1".to_string())]),
        ]);
        let resolved = flatten_config_sets(&init).unwrap();
        assert_eq!(resolved["A"], vec!["c1".to_string(), "c2".to_string()]);
    }

    #[test]
    fn cycle_is_detected() {
        let init = init_with(&[
            ("A", vec![ConfigSetElement::SetRef("B".to_string())]),
            ("B", vec![ConfigSetElement::SetRef("A".to_string())]),
        ]);
        let err = flatten_config_sets(&init).unwrap_err();
        assert!(matches!(err, BuildError::CircularConfigSetDependency(_)));
    }

    #[test]
    fn reference_to_unknown_set_is_rejected() {
        let init = init_with(&[("A", vec![ConfigSetElement::SetRef("missing".to_string())])]);
        let err = flatten_config_sets(&init).unwrap_err();
        assert!(matches!(err, BuildError::NoSuchConfigSet(name) if name == "missing"));
    }

    #[test]
    fn nested_list_references_are_collected() {
        let init = init_with(&[
            (
                "A",
                vec![ConfigSetElement::List(vec![
                    ConfigSetElement::SetRef("B".to_string()),
                    ConfigSetElement::Config("c2".to_string()),
                ])],
            ),
            ("B", vec![ConfigSetElement::Config("c1".to_string())]),
        ]);
        let resolved = flatten_config_sets(&init).unwrap();
        assert_eq!(resolved["A"], vec!["c1".to_string(), "c2".to_string()]);
    }
}
