//! Sync-daemon HTTP client: `get`/`post` against `http://localhost:<port>
//! /rest/…` with `X-API-Key` auth and retries, plus the ignore-list
//! read-modify-write helpers §4.11 names. Grounded on
//! `examples/original_source/util.py`'s `get_syncthing`/`post_syncthing`/
//! `extend_ignores`.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;
use triarchive_core::{TriarchiveError, TriarchiveResult};

pub struct SyncDaemonClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl SyncDaemonClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            retry_count,
            retry_delay,
        }
    }

    /// GET `rest/<path>?<query>`. On transport failure or an unexpected
    /// status, retries up to `retry_count` times. If the final status is
    /// in `expected_error_codes`, the body is returned without error.
    pub async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
        expected_error_codes: &[u16],
    ) -> TriarchiveResult<Value> {
        let url = format!("{}/rest/{}", self.base_url, path);
        self.request_with_retry(self.client.get(&url).query(query), expected_error_codes)
            .await
    }

    pub async fn post(
        &self,
        path: &str,
        body: &Value,
        query: &[(&str, String)],
        expected_error_codes: &[u16],
    ) -> TriarchiveResult<Value> {
        let url = format!("{}/rest/{}", self.base_url, path);
        self.request_with_retry(
            self.client.post(&url).query(query).json(body),
            expected_error_codes,
        )
        .await
    }

    async fn request_with_retry(
        &self,
        request: reqwest::RequestBuilder,
        expected_error_codes: &[u16],
    ) -> TriarchiveResult<Value> {
        let mut last_err = None;
        for attempt in 0..self.retry_count.max(1) {
            let cloned = request
                .try_clone()
                .expect("request body must be cloneable for retries")
                .header("X-API-Key", &self.api_key);

            match cloned.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() || expected_error_codes.contains(&status) {
                        let text = response.text().await.unwrap_or_default();
                        return Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)));
                    }
                    warn!(status, attempt, "unexpected sync-daemon status, retrying");
                    last_err = Some(TriarchiveError::Transient(format!("unexpected status {status}")));
                }
                Err(err) => {
                    warn!(error = %err, attempt, "sync-daemon request failed, retrying");
                    last_err = Some(TriarchiveError::Transient(err.to_string()));
                }
            }
            if attempt + 1 < self.retry_count {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        Err(last_err.unwrap_or_else(|| TriarchiveError::Transient("sync daemon unreachable".into())))
    }

    pub async fn get_ignores(&self, folder_id: &str) -> TriarchiveResult<Vec<String>> {
        let response = self
            .get("db/ignores", &[("folder", folder_id.to_string())], &[])
            .await?;
        response
            .get("ignore")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .ok_or_else(|| TriarchiveError::Transient("ignores response missing 'ignore' key".into()))
    }

    pub async fn set_ignores(&self, folder_id: &str, ignores: &[String]) -> TriarchiveResult<Vec<String>> {
        let body = serde_json::json!({ "ignore": ignores });
        let response = self
            .post("db/ignores", &body, &[("folder", folder_id.to_string())], &[])
            .await?;
        response
            .get("ignore")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .ok_or_else(|| TriarchiveError::Transient("ignores response missing 'ignore' key".into()))
    }

    /// Read-modify-write against the ignore list: GET, apply `transform`,
    /// POST, and verify the server echoes the expected set.
    pub async fn modify_ignores<F>(&self, folder_id: &str, transform: F) -> TriarchiveResult<()>
    where
        F: FnOnce(Vec<String>) -> Vec<String>,
    {
        let current = self.get_ignores(folder_id).await?;
        let desired = transform(current);
        let desired_set: std::collections::HashSet<_> = desired.iter().cloned().collect();

        let echoed = self.set_ignores(folder_id, &desired).await?;
        let echoed_set: std::collections::HashSet<_> = echoed.into_iter().collect();

        if echoed_set != desired_set {
            return Err(TriarchiveError::Transient(
                "sync daemon did not echo back the requested ignore list".into(),
            ));
        }
        Ok(())
    }

    /// Normalizes each path to a leading slash and unions it into the
    /// current ignore list.
    pub async fn extend_ignores(&self, folder_id: &str, new_paths: &[String]) -> TriarchiveResult<()> {
        let normalized: Vec<String> = new_paths.iter().map(|p| normalize_leading_slash(p)).collect();
        self.modify_ignores(folder_id, move |current| {
            let mut set: std::collections::HashSet<String> = current.into_iter().collect();
            set.extend(normalized);
            set.into_iter().collect()
        })
        .await
    }

    /// Set-difference: removes `paths` from the current ignore list.
    pub async fn discard_ignores(&self, folder_id: &str, paths: &[String]) -> TriarchiveResult<()> {
        let normalized: std::collections::HashSet<String> =
            paths.iter().map(|p| normalize_leading_slash(p)).collect();
        self.modify_ignores(folder_id, move |current| {
            current.into_iter().filter(|p| !normalized.contains(p)).collect()
        })
        .await
    }

    /// After sorting, keeps only paths with no strict-prefix successor
    /// (a parent directory ignore already covers its children).
    pub async fn remove_parents_from_ignores(&self, folder_id: &str) -> TriarchiveResult<()> {
        self.modify_ignores(folder_id, |mut current| {
            current.sort();
            remove_redundant_child_entries(current)
        })
        .await
    }
}

fn normalize_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn remove_redundant_child_entries(sorted: Vec<String>) -> Vec<String> {
    let mut kept: Vec<String> = Vec::new();
    for path in sorted {
        let is_covered = kept
            .last()
            .map(|parent| path.starts_with(parent) && path.len() > parent.len())
            .unwrap_or(false);
        if !is_covered {
            kept.push(path);
        }
    }
    kept
}

/// A node in the sync daemon's `db/browse` response tree.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct BrowseNode {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(rename = "modTime", default)]
    pub mod_time: Option<String>,
    #[serde(default)]
    pub children: Vec<BrowseNode>,
}

impl BrowseNode {
    pub fn is_directory(&self) -> bool {
        self.kind == "FILE_INFO_TYPE_DIRECTORY"
    }
}

pub fn parse_browse_response(value: &Value) -> Vec<BrowseNode> {
    serde_json::from_value::<Vec<BrowseNode>>(value.clone()).unwrap_or_default()
}

/// Reads the `since`/`timeout` events query, retaining the flexible shape
/// the daemon's `events/disk` endpoint returns (two event kinds plus a
/// pass-through for anything unrecognized).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DiskEvent {
    pub id: i64,
    #[serde(rename = "globalID", default)]
    pub global_id: Option<i64>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

pub fn parse_events_response(value: &Value) -> Vec<DiskEvent> {
    serde_json::from_value::<Vec<DiskEvent>>(value.clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_adds_leading_slash_when_missing() {
        assert_eq!(normalize_leading_slash("a/b"), "/a/b");
        assert_eq!(normalize_leading_slash("/a/b"), "/a/b");
    }

    #[test]
    fn remove_redundant_child_entries_drops_paths_under_a_kept_parent() {
        let sorted = vec!["/a".to_string(), "/a/b".to_string(), "/c".to_string()];
        assert_eq!(remove_redundant_child_entries(sorted), vec!["/a", "/c"]);
    }

    #[tokio::test]
    async fn extend_ignores_is_idempotent() {
        let server = wiremock::MockServer::start().await;
        let state = std::sync::Arc::new(std::sync::Mutex::new(vec!["/x".to_string()]));

        {
            let state = state.clone();
            wiremock::Mock::given(wiremock::matchers::method("GET"))
                .and(wiremock::matchers::path("/rest/db/ignores"))
                .respond_with(move |_: &wiremock::Request| {
                    let ignore = state.lock().unwrap().clone();
                    wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ignore": ignore }))
                })
                .mount(&server)
                .await;
        }
        {
            let state = state.clone();
            wiremock::Mock::given(wiremock::matchers::method("POST"))
                .and(wiremock::matchers::path("/rest/db/ignores"))
                .respond_with(move |req: &wiremock::Request| {
                    let body: Value = serde_json::from_slice(&req.body).unwrap();
                    let new_ignore: Vec<String> = body["ignore"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .map(|v| v.as_str().unwrap().to_string())
                        .collect();
                    *state.lock().unwrap() = new_ignore.clone();
                    wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ignore": new_ignore }))
                })
                .mount(&server)
                .await;
        }

        let client = SyncDaemonClient::new(server.uri(), "key", 3, Duration::from_millis(1));
        client
            .extend_ignores("f1", &["new/path".to_string()])
            .await
            .unwrap();
        let after_first = state.lock().unwrap().clone();

        client
            .extend_ignores("f1", &["new/path".to_string()])
            .await
            .unwrap();
        let after_second = state.lock().unwrap().clone();

        let set_a: std::collections::HashSet<_> = after_first.into_iter().collect();
        let set_b: std::collections::HashSet<_> = after_second.into_iter().collect();
        assert_eq!(set_a, set_b);
    }
}
