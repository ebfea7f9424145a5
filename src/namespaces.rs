//! Namespace selection validation and wildcard expansion.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{error, info, warn};

use crate::keychain::glob_to_regex;

fn has_wildcard(value: &str) -> bool {
    value.contains(['*', '?', '['])
}

/// Expands the configured selections against the live namespace list.
/// `*` (or an empty selection) means all namespaces.
pub async fn validate_and_expand_namespaces(
    client: &Client,
    selections: &[String],
) -> Result<Vec<String>> {
    let normalized: Vec<String> = selections
        .iter()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect();
    if normalized.is_empty() || normalized.iter().any(|s| s == "*") {
        return Ok(vec!["*".to_owned()]);
    }

    let api: Api<Namespace> = Api::all(client.clone());
    let list = api
        .list(&ListParams::default())
        .await
        .context("list namespaces")?;
    let existing: Vec<String> = list.iter().map(|ns| ns.name_any()).collect();

    Ok(expand_selections(&normalized, &existing))
}

fn expand_selections(selections: &[String], existing: &[String]) -> Vec<String> {
    let mut results: Vec<String> = Vec::new();
    for selection in selections {
        if has_wildcard(selection) {
            let Some(pattern) = glob_to_regex(selection) else {
                error!(pattern = %selection, "invalid namespace pattern");
                continue;
            };
            let mut matches: Vec<&String> =
                existing.iter().filter(|ns| pattern.is_match(ns)).collect();
            if matches.is_empty() {
                info!(pattern = %selection, "namespace wildcard matched no namespaces");
                continue;
            }
            matches.sort();
            for name in matches {
                if !results.contains(name) {
                    results.push(name.clone());
                }
            }
            continue;
        }

        if !existing.contains(selection) {
            warn!(namespace = %selection, "configured namespace does not exist");
        }
        if !results.contains(selection) {
            results.push(selection.clone());
        }
    }
    results.sort();
    results
}
