//! Hook processor (C7): one poll tick walks every hook in order, resolves
//! its path against the freshly-fetched resource detail, classifies the
//! add/remove/update transition against the persistent store, and fires
//! the hook's action when the transition matches its declared triggers.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use serde_json::Value;

use crate::error::UpdateError;
use crate::metadata;
use crate::model::{Credentials, Hook, StackResourceDetail, Trigger};
use crate::process::{run, Invocation, RunOptions};
use crate::store::{Store, TaggedValue};

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathShape {
    LastUpdated,
    PhysicalResourceId,
    Metadata(Vec<String>),
}

impl PathShape {
    fn env_key(&self) -> &'static str {
        match self {
            PathShape::LastUpdated => "LAST_UPDATED",
            PathShape::PhysicalResourceId => "PHYSICAL_RESOURCE_ID",
            PathShape::Metadata(_) => "METADATA",
        }
    }
}

enum Transition {
    Add,
    Remove,
    Update,
    None,
}

/// Runs one poll tick: every hook in `hooks`, in order, against `store`.
/// Any per-hook failure other than an invalid path is logged and skipped;
/// an invalid path aborts the whole tick.
pub fn poll_once(
    hooks: &[Hook],
    store: &mut Store,
    stack_name: &str,
    region: &str,
    credentials: &Credentials,
) -> Result<(), UpdateError> {
    let mut cache: HashMap<String, Rc<Result<StackResourceDetail, String>>> = HashMap::new();

    for hook in hooks {
        let (logical_id, shape) = parse_hook_path(&hook.path)?;

        let detail_result = cache
            .entry(logical_id.clone())
            .or_insert_with(|| {
                Rc::new(
                    metadata::describe_stack_resource(&logical_id, stack_name, region, credentials)
                        .map_err(|e| e.to_string()),
                )
            })
            .clone();

        let detail = match detail_result.as_ref() {
            Ok(d) => d,
            Err(e) => {
                crate::log::warn!("hook {:?}: fetching {logical_id}: {e}", hook.name);
                continue;
            }
        };

        if detail.status.ends_with("_IN_PROGRESS") {
            continue;
        }

        let new_value = observed_value(detail, &shape);
        let store_key = format!("{}|{}", hook.name, hook.path);
        let old_value = store.get(&store_key).map(tagged_to_value);

        match classify(&hook.triggers, &old_value, &new_value) {
            Transition::None => {
                if let Err(e) = commit(store, &store_key, &new_value) {
                    crate::log::warn!("hook {:?}: persisting state: {e}", hook.name);
                }
            }
            _ => fire(hook, &shape, &old_value, &new_value, store, &store_key),
        }
    }

    Ok(())
}

fn fire(
    hook: &Hook,
    shape: &PathShape,
    old_value: &Option<Value>,
    new_value: &Option<Value>,
    store: &mut Store,
    store_key: &str,
) {
    let mut env = HashMap::new();
    if let Some(old) = old_value {
        env.insert(format!("CFN_OLD_{}", shape.env_key()), stringify_value(old));
    }
    if let Some(new) = new_value {
        env.insert(format!("CFN_NEW_{}", shape.env_key()), stringify_value(new));
    }

    let invocation = build_invocation(&hook.action, hook.run_as.as_deref());
    let outcome = run(&invocation, RunOptions { env: Some(&env), ..Default::default() });

    match outcome {
        Ok(out) if out.success() => {
            if let Err(e) = commit(store, store_key, new_value) {
                crate::log::warn!("hook {:?}: persisting state: {e}", hook.name);
            }
        }
        Ok(out) => {
            crate::log::warn!(
                "hook {:?}: action exited {}, leaving prior state in place: {}",
                hook.name,
                out.exit_code,
                out.stderr.trim()
            );
        }
        Err(e) => {
            crate::log::warn!("hook {:?}: running action: {e}", hook.name);
        }
    }
}

fn commit(store: &mut Store, key: &str, new_value: &Option<Value>) -> std::io::Result<()> {
    store.set(key.to_string(), TaggedValue::Json(new_value.clone().unwrap_or(Value::Null)))
}

fn tagged_to_value(tagged: &TaggedValue) -> Value {
    match tagged {
        TaggedValue::Json(v) => v.clone(),
        TaggedValue::Timestamp(d) => Value::String(d.to_rfc3339()),
    }
}

fn build_invocation(action: &str, run_as: Option<&str>) -> Invocation {
    match run_as {
        Some(user) => Invocation::Shell(format!("su {} -c {}", shell_quote(user), shell_quote(action))),
        None => Invocation::Shell(action.to_string()),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `Resources.<logicalId>[.Metadata|.PhysicalResourceId][.<subkey>]`. A
/// two-segment path resolves to `lastUpdated`.
fn parse_hook_path(path: &str) -> Result<(String, PathShape), UpdateError> {
    let segments = split_dotted(path);

    if segments.first().map(String::as_str) != Some("Resources") {
        return Err(UpdateError::new(path, "path must start with Resources"));
    }

    let logical_id = match segments.get(1) {
        Some(s) if !s.is_empty() => s.clone(),
        _ => return Err(UpdateError::new(path, "missing resource logical id")),
    };

    if segments.len() == 2 {
        return Ok((logical_id, PathShape::LastUpdated));
    }

    let shape = match segments[2].as_str() {
        "Metadata" => PathShape::Metadata(segments[3..].to_vec()),
        "PhysicalResourceId" => PathShape::PhysicalResourceId,
        other => return Err(UpdateError::new(path, format!("unknown path component {other:?}"))),
    };

    Ok((logical_id, shape))
}

/// Splits on unescaped `.`; `\.` is a literal dot.
fn split_dotted(path: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&'.') {
            current.push('.');
            chars.next();
        } else if c == '.' {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

fn observed_value(detail: &StackResourceDetail, shape: &PathShape) -> Option<Value> {
    if detail.status == "DELETE_COMPLETE" {
        return None;
    }

    match shape {
        PathShape::LastUpdated => detail.last_updated.map(|d| Value::String(d.to_rfc3339())),
        PathShape::PhysicalResourceId => detail.physical_id.clone().map(Value::String),
        PathShape::Metadata(subkey) => {
            let metadata = detail.metadata.as_ref()?;
            if subkey.is_empty() {
                Some(metadata.clone())
            } else {
                extract_value(metadata, subkey)
            }
        }
    }
}

fn extract_value(root: &Value, segments: &[String]) -> Option<Value> {
    let mut current = root;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

fn is_truthy(value: &Option<Value>) -> bool {
    match value {
        None => false,
        Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

fn classify(triggers: &BTreeSet<Trigger>, old_value: &Option<Value>, new_value: &Option<Value>) -> Transition {
    let old_truthy = is_truthy(old_value);
    let new_truthy = is_truthy(new_value);

    if triggers.contains(&Trigger::PostAdd) && !old_truthy && new_truthy {
        return Transition::Add;
    }
    if triggers.contains(&Trigger::PostRemove) && old_truthy && !new_truthy {
        return Transition::Remove;
    }
    if triggers.contains(&Trigger::PostUpdate) && old_truthy && new_truthy && old_value != new_value {
        return Transition::Update;
    }
    Transition::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_segment_path_is_last_updated() {
        let (logical_id, shape) = parse_hook_path("Resources.WebServer").unwrap();
        assert_eq!(logical_id, "WebServer");
        assert_eq!(shape, PathShape::LastUpdated);
    }

    #[test]
    fn metadata_path_collects_subkey_segments() {
        let (logical_id, shape) = parse_hook_path("Resources.WebServer.Metadata.app.version").unwrap();
        assert_eq!(logical_id, "WebServer");
        assert_eq!(shape, PathShape::Metadata(vec!["app".to_string(), "version".to_string()]));
    }

    #[test]
    fn escaped_dot_is_kept_literal() {
        let segments = split_dotted(r"Resources.WebServer.Metadata.a\.b");
        assert_eq!(segments, vec!["Resources", "WebServer", "Metadata", "a.b"]);
    }

    #[test]
    fn path_not_starting_with_resources_is_rejected() {
        assert!(parse_hook_path("Outputs.WebServer").is_err());
    }

    #[test]
    fn missing_logical_id_is_rejected() {
        assert!(parse_hook_path("Resources.").is_err());
    }

    #[test]
    fn unknown_third_segment_is_rejected() {
        assert!(parse_hook_path("Resources.WebServer.Bogus").is_err());
    }

    #[test]
    fn add_transition_requires_post_add_trigger() {
        let mut triggers = BTreeSet::new();
        triggers.insert(Trigger::PostAdd);
        let old = None;
        let new = Some(Value::String("v1".to_string()));
        assert!(matches!(classify(&triggers, &old, &new), Transition::Add));
    }

    #[test]
    fn remove_transition_requires_post_remove_trigger() {
        let mut triggers = BTreeSet::new();
        triggers.insert(Trigger::PostRemove);
        let old = Some(Value::String("v1".to_string()));
        let new = None;
        assert!(matches!(classify(&triggers, &old, &new), Transition::Remove));
    }

    #[test]
    fn update_transition_requires_value_change() {
        let mut triggers = BTreeSet::new();
        triggers.insert(Trigger::PostUpdate);
        let old = Some(Value::String("v1".to_string()));
        let same = Some(Value::String("v1".to_string()));
        assert!(matches!(classify(&triggers, &old, &same), Transition::None));

        let new = Some(Value::String("v2".to_string()));
        assert!(matches!(classify(&triggers, &old, &new), Transition::Update));
    }

    #[test]
    fn extract_value_walks_nested_object() {
        let root = serde_json::json!({"a": {"b": {"c": 42}}});
        let segs = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(extract_value(&root, &segs), Some(Value::from(42)));
    }

    #[test]
    fn extract_value_missing_intermediate_yields_none() {
        let root = serde_json::json!({"a": {}});
        let segs = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(extract_value(&root, &segs), None);
    }
}
