//! GitHub webhook handler: turns push and pull request events into changes.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use ci_engine::{BuildMaster, NewChange, Revision};
use serde_json::{json, Value};

use crate::config::CiConfig;
use crate::services::github_service;

use super::engine_error;

/// Handle an incoming GitHub webhook payload.
pub fn handle_webhook(
    config: &CiConfig,
    master: &BuildMaster,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    // Validate signature
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !github_service::validate_signature(&config.github_webhook_secret, &body, signature) {
        tracing::warn!("Webhook signature validation failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    // Parse event type
    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let payload: Value = serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    let changes = match event_type {
        "push" => push_changes(&payload),
        "pull_request" => pull_request_change(&payload).into_iter().collect(),
        "ping" => {
            tracing::info!("Received GitHub ping webhook");
            return Ok(StatusCode::OK);
        }
        _ => {
            tracing::debug!("Ignoring webhook event: {}", event_type);
            return Ok(StatusCode::OK);
        }
    };

    if changes.is_empty() {
        return Ok(StatusCode::OK);
    }
    for change in changes {
        master.add_change(change).map_err(engine_error)?;
    }
    Ok(StatusCode::CREATED)
}

/// One change per pushed commit, oldest first. Tag pushes and branch
/// deletions produce nothing.
fn push_changes(payload: &Value) -> Vec<NewChange> {
    let Some(branch) = payload["ref"]
        .as_str()
        .and_then(|r| r.strip_prefix("refs/heads/"))
    else {
        return Vec::new();
    };
    if payload["deleted"].as_bool().unwrap_or(false) {
        return Vec::new();
    }

    let repository = repository_url(&payload["repository"]);
    let project = payload["repository"]["full_name"]
        .as_str()
        .unwrap_or_default();

    let Some(commits) = payload["commits"].as_array() else {
        return Vec::new();
    };
    commits
        .iter()
        .filter_map(|commit| {
            let sha = commit["id"].as_str().filter(|s| !s.is_empty())?;
            let who = commit["author"]["username"]
                .as_str()
                .or_else(|| commit["author"]["name"].as_str())
                .unwrap_or("unknown");
            let files = ["added", "removed", "modified"]
                .iter()
                .filter_map(|key| commit[*key].as_array())
                .flatten()
                .filter_map(|f| f.as_str().map(str::to_string))
                .collect();
            let when = commit["timestamp"]
                .as_str()
                .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&chrono::Utc));

            let mut properties = ci_engine::PropertyMap::new();
            properties.insert("event".into(), json!("push"));
            Some(NewChange {
                who: who.to_string(),
                files,
                comments: commit["message"].as_str().unwrap_or_default().to_string(),
                project: project.to_string(),
                repository: repository.clone(),
                revision: Some(Revision::Hash(sha.to_string())),
                branch: Some(branch.to_string()),
                properties,
                when,
            })
        })
        .collect()
}

fn pull_request_change(payload: &Value) -> Option<NewChange> {
    let action = payload["action"].as_str().unwrap_or_default();
    if action != "opened" && action != "synchronize" && action != "reopened" {
        return None;
    }

    let pr = &payload["pull_request"];
    let sha = pr["head"]["sha"].as_str().filter(|s| !s.is_empty())?;
    let branch = pr["head"]["ref"].as_str().filter(|s| !s.is_empty())?;
    let author = pr["user"]["login"].as_str().unwrap_or("unknown");

    let mut properties = ci_engine::PropertyMap::new();
    properties.insert("event".into(), json!("pull_request"));
    properties.insert("pr_number".into(), payload["number"].clone());
    Some(NewChange {
        who: author.to_string(),
        comments: pr["title"].as_str().unwrap_or_default().to_string(),
        project: payload["repository"]["full_name"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        repository: repository_url(&pr["head"]["repo"]),
        revision: Some(Revision::Hash(sha.to_string())),
        branch: Some(branch.to_string()),
        properties,
        ..NewChange::default()
    })
}

fn repository_url(repo: &Value) -> String {
    repo["clone_url"]
        .as_str()
        .or_else(|| repo["html_url"].as_str())
        .unwrap_or_default()
        .to_string()
}
