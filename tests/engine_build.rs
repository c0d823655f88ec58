//! End-to-end construction-engine scenarios, driven through the public
//! `engine::build` entry point against a real temp filesystem. No network
//! or package-manager access is exercised: every model here only touches
//! `commands`/`files`, which run through `/bin/sh` and local I/O.

use stack_init::auth::AuthRegistry;
use stack_init::engine;
use stack_init::error::BuildError;
use stack_init::model::{parse_model, ChangeCategory, INIT_KEY};
use stack_init::retry::HttpClient;
use stack_init::tools::ToolContext;

fn ctx(http: &HttpClient, auth: &AuthRegistry) -> ToolContext<'_> {
    ToolContext { http, auth }
}

#[test]
fn single_config_build_runs_commands_and_writes_files() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker.txt");

    let root = serde_json::json!({
        INIT_KEY: {
            "config": {
                "files": {
                    marker.to_str().unwrap(): {
                        "content": "hello",
                        "mode": "000644",
                    }
                },
                "commands": {
                    "01_touch": {
                        "command": format!("echo ran >> {}", marker.to_str().unwrap()),
                    }
                }
            }
        }
    });

    let model = parse_model(&root).unwrap();
    let http = HttpClient::default();
    let auth = AuthRegistry::from_section(&model.authentication);
    let tool_ctx = ctx(&http, &auth);

    let changes = engine::build(&model, &["default".to_string()], &tool_ctx).unwrap();

    assert!(changes.get(ChangeCategory::Files).contains(marker.to_str().unwrap()));
    assert!(changes.get(ChangeCategory::Commands).contains("01_touch"));

    let contents = std::fs::read_to_string(&marker).unwrap();
    assert!(contents.contains("hello"));
    assert!(contents.contains("ran"));
}

#[test]
fn configset_ref_expands_in_place() {
    let root = serde_json::json!({
        INIT_KEY: {
            "configSets": {
                "A": ["c1", {"ConfigSet": "B"}, "c3"],
                "B": ["c2"]
            },
            "c1": {"commands": {"only": {"command": "exit 0"}}},
            "c2": {"commands": {"only": {"command": "exit 0"}}},
            "c3": {"commands": {"only": {"command": "exit 0"}}}
        }
    });

    let model = parse_model(&root).unwrap();
    let http = HttpClient::default();
    let auth = AuthRegistry::from_section(&model.authentication);
    let tool_ctx = ctx(&http, &auth);

    // This mostly exercises flatten_config_sets via the public build() path;
    // a successful build with no error confirms "B" resolved before "c3" ran.
    let changes = engine::build(&model, &["A".to_string()], &tool_ctx).unwrap();
    assert!(changes.get(ChangeCategory::Commands).contains("only"));
}

#[test]
fn circular_configset_dependency_aborts_the_build() {
    let root = serde_json::json!({
        INIT_KEY: {
            "configSets": {
                "A": [{"ConfigSet": "B"}],
                "B": [{"ConfigSet": "A"}]
            },
            "config": {}
        }
    });

    let model = parse_model(&root).unwrap();
    let http = HttpClient::default();
    let auth = AuthRegistry::from_section(&model.authentication);
    let tool_ctx = ctx(&http, &auth);

    let err = engine::build(&model, &["A".to_string()], &tool_ctx).unwrap_err();
    assert!(matches!(err, BuildError::CircularConfigSetDependency(_)));
}

#[test]
fn unknown_configset_name_is_rejected() {
    let root = serde_json::json!({
        INIT_KEY: {
            "config": {}
        }
    });

    let model = parse_model(&root).unwrap();
    let http = HttpClient::default();
    let auth = AuthRegistry::from_section(&model.authentication);
    let tool_ctx = ctx(&http, &auth);

    let err = engine::build(&model, &["nope".to_string()], &tool_ctx).unwrap_err();
    assert!(matches!(err, BuildError::NoSuchConfigSet(name) if name == "nope"));
}

#[test]
fn file_tool_template_substitution_runs_inside_a_full_build() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("greeting.txt");

    let root = serde_json::json!({
        INIT_KEY: {
            "config": {
                "files": {
                    target.to_str().unwrap(): {
                        "content": "hello ${name}",
                        "context": {"name": "world"}
                    }
                }
            }
        }
    });

    let model = parse_model(&root).unwrap();
    let http = HttpClient::default();
    let auth = AuthRegistry::from_section(&model.authentication);
    let tool_ctx = ctx(&http, &auth);

    engine::build(&model, &["default".to_string()], &tool_ctx).unwrap();
    let contents = std::fs::read_to_string(&target).unwrap();
    assert_eq!(contents, "hello world");
}

#[test]
fn repeated_builds_of_the_same_model_succeed() {
    // CommandTool always runs its command; this just confirms a second
    // build against the same model doesn't fail or hang.
    let root = serde_json::json!({
        INIT_KEY: {
            "config": {"commands": {"c": {"command": "exit 0"}}}
        }
    });
    let model = parse_model(&root).unwrap();
    let http = HttpClient::default();
    let auth = AuthRegistry::from_section(&model.authentication);
    let tool_ctx = ctx(&http, &auth);

    engine::build(&model, &["default".to_string()], &tool_ctx).unwrap();
    let changes = engine::build(&model, &["default".to_string()], &tool_ctx).unwrap();
    assert!(changes.get(ChangeCategory::Commands).contains("c"));
}
