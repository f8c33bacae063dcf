//! A fake sync daemon, backed by `wiremock`, answering the subset of
//! `/rest/...` endpoints §6 enumerates.

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub struct FakeSyncDaemon {
    pub server: MockServer,
}

impl FakeSyncDaemon {
    pub async fn start() -> Self {
        Self { server: MockServer::start().await }
    }

    pub fn base_url(&self) -> String {
        self.server.uri()
    }

    /// Stubs `GET /rest/events/disk` to return `events` once, then an
    /// empty array on every subsequent call (so a listener loop that
    /// keeps polling doesn't spin on the same batch forever).
    pub async fn stub_disk_events(&self, events: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/rest/events/disk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(events))
            .up_to_n_times(1)
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/events/disk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&self.server)
            .await;
    }

    pub async fn stub_ignores(&self, ignore: Vec<String>) {
        Mock::given(method("GET"))
            .and(path("/rest/db/ignores"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ignore": ignore})))
            .mount(&self.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/db/ignores"))
            .respond_with(move |request: &wiremock::Request| {
                let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap_or(json!({}));
                ResponseTemplate::new(200).set_body_json(body)
            })
            .mount(&self.server)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stubbed_disk_events_are_served_once_then_empty() {
        let daemon = FakeSyncDaemon::start().await;
        daemon.stub_disk_events(json!([{"id": 1, "type": "LocalChangeDetected"}])).await;
        let client = reqwest::Client::new();
        let first: serde_json::Value = client
            .get(format!("{}/rest/events/disk", daemon.base_url()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(first.as_array().unwrap().len(), 1);
        let second: serde_json::Value = client
            .get(format!("{}/rest/events/disk", daemon.base_url()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(second.as_array().unwrap().len(), 0);
    }
}
