//! Tool dispatch layer (C4): one module per domain, each exposing an
//! idempotent `apply(spec, ctx) -> Vec<changed names>` entry point.
//!
//! Tools fire in the fixed order the construction engine drives them in:
//! packages -> groups -> users -> sources -> files -> commands -> services.

pub mod commands;
pub mod files;
pub mod groups;
pub mod packages;
pub mod service;
pub mod sources;
pub mod users;

use crate::auth::AuthRegistry;
use crate::retry::HttpClient;

/// Shared context borrowed by every tool for the duration of one
/// `apply` call. Tools never retain it.
pub struct ToolContext<'a> {
    pub http: &'a HttpClient,
    pub auth: &'a AuthRegistry,
}

/// Orders package/service manager names the way spec.md §4.4.1 requires:
/// `dpkg, rpm, apt, yum` first in that order, then any unrecognised
/// managers in case-insensitive lexical order.
pub fn order_managers(names: impl IntoIterator<Item = String>) -> Vec<String> {
    const PRIORITY: &[&str] = &["dpkg", "rpm", "apt", "yum"];
    let mut names: Vec<String> = names.into_iter().collect();
    names.sort_by(|a, b| {
        let ia = PRIORITY.iter().position(|p| p.eq_ignore_ascii_case(a));
        let ib = PRIORITY.iter().position(|p| p.eq_ignore_ascii_case(b));
        match (ia, ib) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.to_lowercase().cmp(&b.to_lowercase()),
        }
    });
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_managers_lead() {
        let ordered = order_managers(vec![
            "yum".to_string(),
            "python".to_string(),
            "dpkg".to_string(),
            "apt".to_string(),
            "rpm".to_string(),
        ]);
        assert_eq!(ordered, vec!["dpkg", "rpm", "apt", "yum", "python"]);
    }

    #[test]
    fn unrecognised_managers_sort_case_insensitively() {
        let ordered = order_managers(vec!["Gem".to_string(), "python".to_string()]);
        assert_eq!(ordered, vec!["Gem", "python"]);
    }
}
