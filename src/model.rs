//! The declarative input model: `Model`, `ConfigDefinition`, `ConfigSet`,
//! `Hook`, `Changes`, and their parsing from an untyped JSON tree.
//!
//! The model is parsed as a recursive tagged tree rather than a single
//! `#[derive(Deserialize)]` struct: unknown tool categories are warned
//! about and skipped (not a hard failure), while a recognised category
//! with a missing required field (e.g. `command` under a `CommandTool`
//! entry) is a hard failure. `serde`'s struct derive can't express that
//! asymmetry cleanly, so each section is walked by hand from a
//! `serde_json::Value`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BuildError;
use crate::log;

pub const INIT_KEY: &str = "AWS::CloudFormation::Init";
pub const AUTH_KEY: &str = "AWS::CloudFormation::Authentication";

/// Tool category, used as the key of the [`Changes`] accumulator. Mirrors
/// spec.md §3's mapping from tool-category to the set of mutated names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeCategory {
    Packages,
    Groups,
    Users,
    Sources,
    Files,
    Commands,
}

impl ChangeCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeCategory::Packages => "packages",
            ChangeCategory::Groups => "groups",
            ChangeCategory::Users => "users",
            ChangeCategory::Sources => "sources",
            ChangeCategory::Files => "files",
            ChangeCategory::Commands => "commands",
        }
    }
}

/// Mapping from tool-category to the set of entity names that category's
/// tool reported as mutated during this build. Owned by one engine
/// invocation, passed by reference into tools; each tool mutates only its
/// own category.
#[derive(Debug, Clone, Default)]
pub struct Changes(BTreeMap<ChangeCategory, BTreeSet<String>>);

impl Changes {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn record(&mut self, category: ChangeCategory, names: impl IntoIterator<Item = String>) {
        self.0.entry(category).or_default().extend(names);
    }

    pub fn contains_any(&self, category: ChangeCategory, names: &[String]) -> bool {
        match self.0.get(&category) {
            Some(set) => names.iter().any(|n| set.contains(n)),
            None => false,
        }
    }

    pub fn get(&self, category: ChangeCategory) -> BTreeSet<String> {
        self.0.get(&category).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|s| s.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChangeCategory, &BTreeSet<String>)> {
        self.0.iter()
    }
}

/// `pkgName -> versionSpec`. `""`/missing means "any version".
#[derive(Debug, Clone)]
pub enum VersionSpec {
    Any,
    Single(String),
    List(Vec<String>),
}

impl VersionSpec {
    pub fn versions(&self) -> Vec<Option<&str>> {
        match self {
            VersionSpec::Any => vec![None],
            VersionSpec::Single(v) => vec![Some(v.as_str())],
            VersionSpec::List(vs) => {
                if vs.is_empty() {
                    vec![None]
                } else {
                    vs.iter().map(|v| Some(v.as_str())).collect()
                }
            }
        }
    }

    fn from_value(v: &Value) -> VersionSpec {
        match v {
            Value::String(s) if s.is_empty() => VersionSpec::Any,
            Value::String(s) => VersionSpec::Single(s.clone()),
            Value::Array(items) => {
                VersionSpec::List(items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect())
            }
            Value::Null => VersionSpec::Any,
            other => VersionSpec::Single(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupSpec {
    pub gid: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct UserSpec {
    pub uid: Option<u32>,
    pub groups: Vec<String>,
    pub home_dir: Option<String>,
}

/// `encoding` of an inline file body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Plain,
    Base64,
}

#[derive(Debug, Clone)]
pub enum FileBody {
    /// Inline content, already decoded to bytes (base64 decoded if needed).
    Inline(Vec<u8>),
    /// Fetch from this URL.
    Source(String),
    /// Neither: mode/owner/group change on an existing file only.
    None,
}

#[derive(Debug, Clone, Default)]
pub struct FileSpec {
    pub body: Option<FileBody>,
    pub mode: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub context: HashMap<String, String>,
    pub authentication: Option<String>,
}

impl Default for FileBody {
    fn default() -> Self {
        FileBody::None
    }
}

#[derive(Debug, Clone)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: CommandLine,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub test: Option<String>,
    pub ignore_errors: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceSpec {
    pub enabled: Option<bool>,
    pub ensure_running: Option<bool>,
    pub files: Vec<String>,
    pub sources: Vec<String>,
    pub packages: HashMap<String, Vec<String>>,
    pub commands: Vec<String>,
}

/// A named bundle of declarative installation directives. All sections are
/// optional; the engine fixes the order in which their tools run, not the
/// model.
#[derive(Debug, Clone, Default)]
pub struct ConfigDefinition {
    pub name: String,
    /// manager -> pkgName -> versionSpec
    pub packages: BTreeMap<String, BTreeMap<String, VersionSpec>>,
    pub groups: BTreeMap<String, GroupSpec>,
    pub users: BTreeMap<String, UserSpec>,
    /// destDir -> archive location, iterated sorted by destDir.
    pub sources: BTreeMap<String, String>,
    pub files: BTreeMap<String, FileSpec>,
    pub commands: BTreeMap<String, CommandSpec>,
    /// manager -> serviceName -> spec
    pub services: BTreeMap<String, BTreeMap<String, ServiceSpec>>,
}

/// One element of a `ConfigSet`'s ordered list.
#[derive(Debug, Clone)]
pub enum ConfigSetElement {
    Config(String),
    SetRef(String),
    List(Vec<ConfigSetElement>),
}

pub type ConfigSetDef = Vec<ConfigSetElement>;

#[derive(Debug, Clone, Default)]
pub struct InitSection {
    pub config_sets: BTreeMap<String, ConfigSetDef>,
    pub configs: HashMap<String, ConfigDefinition>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum AuthEntry {
    #[serde(rename = "S3")]
    S3 {
        #[serde(rename = "accessKeyId")]
        access_key_id: Option<String>,
        #[serde(rename = "secretAccessKey")]
        secret_access_key: Option<String>,
        buckets: Option<Vec<String>>,
        #[serde(rename = "roleName")]
        role_name: Option<String>,
    },
    #[serde(rename = "basic")]
    Basic {
        username: String,
        password: String,
        uris: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct AuthenticationSection {
    pub entries: BTreeMap<String, AuthEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct Model {
    pub init: InitSection,
    pub authentication: AuthenticationSection,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Trigger {
    PostAdd,
    PostRemove,
    PostUpdate,
}

impl Trigger {
    pub fn parse(s: &str) -> Option<Trigger> {
        match s {
            "post.add" => Some(Trigger::PostAdd),
            "post.remove" => Some(Trigger::PostRemove),
            "post.update" => Some(Trigger::PostUpdate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Hook {
    pub name: String,
    pub triggers: BTreeSet<Trigger>,
    pub path: String,
    pub action: String,
    pub run_as: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StackResourceDetail {
    pub logical_id: String,
    pub physical_id: Option<String>,
    pub metadata: Option<Value>,
    pub status: String,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub security_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────

pub fn parse_model(root: &Value) -> Result<Model, BuildError> {
    let obj = root
        .as_object()
        .ok_or_else(|| BuildError::InvalidModel("top level must be a JSON object".into()))?;

    let init = match obj.get(INIT_KEY) {
        Some(v) => parse_init_section(v)?,
        None => {
            return Err(BuildError::InvalidModel(format!(
                "missing required key {INIT_KEY}"
            )))
        }
    };

    let authentication = match obj.get(AUTH_KEY) {
        Some(v) => parse_authentication(v),
        None => AuthenticationSection::default(),
    };

    Ok(Model { init, authentication })
}

fn parse_authentication(v: &Value) -> AuthenticationSection {
    let mut entries = BTreeMap::new();
    if let Some(obj) = v.as_object() {
        for (key, entry_value) in obj {
            match serde_json::from_value::<AuthEntry>(entry_value.clone()) {
                Ok(entry) => {
                    entries.insert(key.clone(), entry);
                }
                Err(e) => {
                    log::warn!("dropping unrecognised authentication entry {key:?}: {e}");
                }
            }
        }
    }
    AuthenticationSection { entries }
}

fn parse_init_section(v: &Value) -> Result<InitSection, BuildError> {
    let obj = v
        .as_object()
        .ok_or_else(|| BuildError::InvalidModel(format!("{INIT_KEY} must be an object")))?;

    let mut configs = HashMap::new();
    for (key, value) in obj {
        if key == "configSets" {
            continue;
        }
        configs.insert(key.clone(), parse_config_definition(key, value)?);
    }

    let config_sets = match obj.get("configSets") {
        Some(Value::Object(sets)) => {
            let mut out = BTreeMap::new();
            for (name, list) in sets {
                out.insert(name.clone(), parse_config_set_elements(list)?);
            }
            out
        }
        Some(_) => return Err(BuildError::InvalidModel("configSets must be an object".into())),
        None => {
            // Implicit `default -> [config]` synthesised from the top-level `config`.
            if configs.contains_key("config") {
                let mut out = BTreeMap::new();
                out.insert("default".to_string(), vec![ConfigSetElement::Config("config".to_string())]);
                out
            } else {
                BTreeMap::new()
            }
        }
    };

    Ok(InitSection { config_sets, configs })
}

fn parse_config_set_elements(v: &Value) -> Result<ConfigSetDef, BuildError> {
    let arr = v
        .as_array()
        .ok_or_else(|| BuildError::InvalidModel("a configSet must be a list".into()))?;
    arr.iter().map(parse_config_set_element).collect()
}

fn parse_config_set_element(v: &Value) -> Result<ConfigSetElement, BuildError> {
    match v {
        Value::String(s) => Ok(ConfigSetElement::Config(s.clone())),
        Value::Object(obj) => {
            let name = obj
                .get("ConfigSet")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    BuildError::InvalidModel(
                        "a configSet reference object must be {\"ConfigSet\": name}".into(),
                    )
                })?;
            Ok(ConfigSetElement::SetRef(name.to_string()))
        }
        Value::Array(_) => Ok(ConfigSetElement::List(parse_config_set_elements(v)?)),
        other => Err(BuildError::InvalidModel(format!(
            "invalid configSet element: {other}"
        ))),
    }
}

fn parse_config_definition(name: &str, v: &Value) -> Result<ConfigDefinition, BuildError> {
    let obj = v
        .as_object()
        .ok_or_else(|| BuildError::InvalidModel(format!("config {name:?} must be an object")))?;

    let mut def = ConfigDefinition {
        name: name.to_string(),
        ..Default::default()
    };

    for (key, value) in obj {
        match key.as_str() {
            "packages" => def.packages = parse_packages(value)?,
            "groups" => def.groups = parse_groups(value)?,
            "users" => def.users = parse_users(value)?,
            "sources" => def.sources = parse_sources(value)?,
            "files" => def.files = parse_files(value)?,
            "commands" => def.commands = parse_commands(value)?,
            "services" => def.services = parse_services(value)?,
            other => {
                log::warn!("config {name:?}: ignoring unknown tool category {other:?}");
            }
        }
    }

    Ok(def)
}

fn as_obj<'a>(v: &'a Value, what: &str) -> Result<&'a serde_json::Map<String, Value>, BuildError> {
    v.as_object()
        .ok_or_else(|| BuildError::InvalidModel(format!("{what} must be an object")))
}

fn parse_packages(v: &Value) -> Result<BTreeMap<String, BTreeMap<String, VersionSpec>>, BuildError> {
    let mut out = BTreeMap::new();
    for (manager, pkgs) in as_obj(v, "packages")? {
        let pkgs_obj = as_obj(pkgs, &format!("packages.{manager}"))?;
        let mut names = BTreeMap::new();
        for (pkg, spec) in pkgs_obj {
            names.insert(pkg.clone(), VersionSpec::from_value(spec));
        }
        out.insert(manager.clone(), names);
    }
    Ok(out)
}

fn parse_groups(v: &Value) -> Result<BTreeMap<String, GroupSpec>, BuildError> {
    let mut out = BTreeMap::new();
    for (name, spec) in as_obj(v, "groups")? {
        let gid = spec.get("gid").and_then(Value::as_u64).map(|g| g as u32);
        out.insert(name.clone(), GroupSpec { gid });
    }
    Ok(out)
}

fn parse_users(v: &Value) -> Result<BTreeMap<String, UserSpec>, BuildError> {
    let mut out = BTreeMap::new();
    for (name, spec) in as_obj(v, "users")? {
        let uid = spec.get("uid").and_then(Value::as_u64).map(|u| u as u32);
        let groups = spec
            .get("groups")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|g| g.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let home_dir = spec.get("homeDir").and_then(Value::as_str).map(str::to_string);
        out.insert(name.clone(), UserSpec { uid, groups, home_dir });
    }
    Ok(out)
}

fn parse_sources(v: &Value) -> Result<BTreeMap<String, String>, BuildError> {
    let mut out = BTreeMap::new();
    for (dest, location) in as_obj(v, "sources")? {
        let loc = location
            .as_str()
            .ok_or_else(|| BuildError::InvalidModel(format!("sources.{dest} must be a string")))?;
        out.insert(dest.clone(), loc.to_string());
    }
    Ok(out)
}

fn parse_files(v: &Value) -> Result<BTreeMap<String, FileSpec>, BuildError> {
    let mut out = BTreeMap::new();
    for (path, spec) in as_obj(v, "files")? {
        let spec_obj = as_obj(spec, &format!("files.{path}"))?;

        let encoding = match spec_obj.get("encoding").and_then(Value::as_str) {
            Some("base64") => Encoding::Base64,
            _ => Encoding::Plain,
        };

        let body = if let Some(content) = spec_obj.get("content") {
            let text = match content {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let bytes = if encoding == Encoding::Base64 {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(text.trim())
                    .map_err(|e| BuildError::InvalidModel(format!("files.{path}: invalid base64: {e}")))?
            } else {
                text.into_bytes()
            };
            Some(FileBody::Inline(bytes))
        } else if let Some(source) = spec_obj.get("source").and_then(Value::as_str) {
            Some(FileBody::Source(source.to_string()))
        } else {
            None
        };

        let mode = match spec_obj.get("mode").and_then(Value::as_str) {
            Some(m) => Some(u32::from_str_radix(m, 8).map_err(|e| {
                BuildError::InvalidModel(format!("files.{path}: invalid octal mode {m:?}: {e}"))
            })?),
            None => None,
        };

        let owner = spec_obj.get("owner").and_then(Value::as_str).map(str::to_string);
        let group = spec_obj.get("group").and_then(Value::as_str).map(str::to_string);
        let authentication = spec_obj
            .get("authentication")
            .and_then(Value::as_str)
            .map(str::to_string);

        let context = spec_obj
            .get("context")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| (k.clone(), value_to_template_string(v)))
                    .collect()
            })
            .unwrap_or_default();

        out.insert(
            path.clone(),
            FileSpec {
                body,
                mode,
                owner,
                group,
                context,
                authentication,
            },
        );
    }
    Ok(out)
}

fn value_to_template_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_commands(v: &Value) -> Result<BTreeMap<String, CommandSpec>, BuildError> {
    let mut out = BTreeMap::new();
    for (name, spec) in as_obj(v, "commands")? {
        let spec_obj = as_obj(spec, &format!("commands.{name}"))?;

        let command = match spec_obj.get("command") {
            Some(Value::String(s)) => CommandLine::Shell(s.clone()),
            Some(Value::Array(items)) => {
                CommandLine::Argv(items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect())
            }
            _ => {
                return Err(BuildError::InvalidModel(format!(
                    "commands.{name}: required field 'command' missing or invalid"
                )))
            }
        };

        let cwd = spec_obj.get("cwd").and_then(Value::as_str).map(str::to_string);
        let env = spec_obj.get("env").and_then(Value::as_object).map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        });
        let test = spec_obj.get("test").and_then(Value::as_str).map(str::to_string);
        let ignore_errors = match spec_obj.get("ignoreErrors") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "yes" | "y" | "1"),
            _ => false,
        };

        out.insert(
            name.clone(),
            CommandSpec {
                command,
                cwd,
                env,
                test,
                ignore_errors,
            },
        );
    }
    Ok(out)
}

fn parse_services(v: &Value) -> Result<BTreeMap<String, BTreeMap<String, ServiceSpec>>, BuildError> {
    let mut out = BTreeMap::new();
    for (manager, svcs) in as_obj(v, "services")? {
        let svcs_obj = as_obj(svcs, &format!("services.{manager}"))?;
        let mut names = BTreeMap::new();
        for (svc_name, spec) in svcs_obj {
            let spec_obj = as_obj(spec, &format!("services.{manager}.{svc_name}"))?;
            let enabled = spec_obj.get("enabled").and_then(Value::as_bool);
            let ensure_running = spec_obj.get("ensureRunning").and_then(Value::as_bool);
            let str_list = |key: &str| -> Vec<String> {
                spec_obj
                    .get(key)
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(|x| x.as_str().map(str::to_string)).collect())
                    .unwrap_or_default()
            };
            let files = str_list("files");
            let sources = str_list("sources");
            let commands = str_list("commands");
            let packages = spec_obj
                .get("packages")
                .and_then(Value::as_object)
                .map(|obj| {
                    obj.iter()
                        .map(|(mgr, names)| {
                            let names = names
                                .as_array()
                                .map(|a| a.iter().filter_map(|x| x.as_str().map(str::to_string)).collect())
                                .unwrap_or_default();
                            (mgr.clone(), names)
                        })
                        .collect()
                })
                .unwrap_or_default();

            names.insert(
                svc_name.clone(),
                ServiceSpec {
                    enabled,
                    ensure_running,
                    files,
                    sources,
                    packages,
                    commands,
                },
            );
        }
        out.insert(manager.clone(), names);
    }
    Ok(out)
}

/// Parse a JSON array of `Hook` objects (used by the `stack-hup` front end,
/// which loads hooks from a standalone file rather than embedded metadata).
pub fn parse_hooks(v: &Value) -> Result<Vec<Hook>, BuildError> {
    let arr = v
        .as_array()
        .ok_or_else(|| BuildError::InvalidModel("hooks must be a JSON array".into()))?;

    let mut seen = std::collections::HashSet::new();
    let mut hooks = Vec::new();
    for item in arr {
        let obj = as_obj(item, "hook")?;
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::InvalidModel("hook missing required field 'name'".into()))?
            .to_string();
        if !seen.insert(name.clone()) {
            return Err(BuildError::InvalidModel(format!("duplicate hook name {name:?}")));
        }
        let path = obj
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::InvalidModel(format!("hook {name:?} missing 'path'")))?
            .to_string();
        let action = obj
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::InvalidModel(format!("hook {name:?} missing 'action'")))?
            .to_string();
        let run_as = obj.get("runAs").and_then(Value::as_str).map(str::to_string);
        let triggers = obj
            .get("triggers")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .filter_map(Trigger::parse)
                    .collect()
            })
            .unwrap_or_default();

        hooks.push(Hook {
            name,
            triggers,
            path,
            action,
            run_as,
        });
    }
    Ok(hooks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_default_config_set() {
        let model = serde_json::json!({
            INIT_KEY: {
                "config": {"commands": {"c1": {"command": ["/bin/true"]}}}
            }
        });
        let parsed = parse_model(&model).unwrap();
        assert!(parsed.init.config_sets.contains_key("default"));
        assert_eq!(parsed.init.config_sets["default"].len(), 1);
    }

    #[test]
    fn unknown_tool_category_is_warned_not_fatal() {
        let model = serde_json::json!({
            INIT_KEY: {
                "config": {"bogusTool": {"x": 1}}
            }
        });
        assert!(parse_model(&model).is_ok());
    }

    #[test]
    fn missing_required_command_field_is_fatal() {
        let model = serde_json::json!({
            INIT_KEY: {
                "config": {"commands": {"c1": {"cwd": "/tmp"}}}
            }
        });
        assert!(parse_model(&model).is_err());
    }

    #[test]
    fn config_set_ref_element_parses() {
        let v = serde_json::json!(["c1", {"ConfigSet": "B"}]);
        let parsed = parse_config_set_elements(&v).unwrap();
        assert!(matches!(parsed[0], ConfigSetElement::Config(ref s) if s == "c1"));
        assert!(matches!(parsed[1], ConfigSetElement::SetRef(ref s) if s == "B"));
    }
}
