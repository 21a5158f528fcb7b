//! GitHub issue actions.

use crate::http::{EndpointConfig, HttpActionAdapter, HttpAdapterConfig};
use anyhow::Result;
use credgate::gateway::ActionSpec;
use std::collections::HashMap;

pub const PROVIDER: &str = "github";
pub const BASE_URL: &str = "https://api.github.com";

pub const ISSUE_CREATE: &str = "github.issue.create";
pub const ISSUE_COMMENT: &str = "github.issue.comment";

/// Action contracts for the GitHub adapter.
pub fn actions() -> Vec<ActionSpec> {
    vec![
        ActionSpec::new(ISSUE_CREATE, PROVIDER)
            .required(&["owner", "repo", "title"])
            .optional(&["body", "labels"])
            .digest_fields(&["owner", "repo", "title", "body"])
            .summary("Open issue '{title}' in {owner}/{repo}"),
        ActionSpec::new(ISSUE_COMMENT, PROVIDER)
            .required(&["owner", "repo", "issue_number", "body"])
            .digest_fields(&["owner", "repo", "issue_number", "body"])
            .summary("Comment on {owner}/{repo}#{issue_number}"),
    ]
}

pub fn adapter_config(base_url: &str) -> HttpAdapterConfig {
    HttpAdapterConfig {
        base_url: base_url.to_string(),
        user_agent: "credgate-github/0.1".to_string(),
        endpoints: HashMap::from([
            (
                ISSUE_CREATE.to_string(),
                EndpointConfig::new("POST", "/repos/{owner}/{repo}/issues"),
            ),
            (
                ISSUE_COMMENT.to_string(),
                EndpointConfig::new("POST", "/repos/{owner}/{repo}/issues/{issue_number}/comments"),
            ),
        ]),
    }
}

/// Adapter against the public GitHub API.
pub fn adapter() -> Result<HttpActionAdapter> {
    HttpActionAdapter::new(PROVIDER, adapter_config(BASE_URL))
}
