use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use super::{RemoteStore, StoreError};
use crate::model::*;

/// `RemoteStore` over the scheduler's REST/JSON API under `{base}/rest`.
pub struct HttpStore {
    client: Client,
    base: String,
    request_timeout: Duration,
    feed_timeout: Duration,
}

#[derive(Deserialize)]
struct TasksBody {
    tasks: Vec<Task>,
}

#[derive(Deserialize)]
struct TaskBody {
    task: Task,
}

#[derive(Deserialize)]
struct ClaimsBody {
    resourceclaims: Vec<ResourceClaim>,
}

#[derive(Deserialize)]
struct ChangesBody {
    #[serde(default)]
    changes: Vec<ChangeRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeNumberBody {
    most_recent_change_number: Option<i64>,
}

#[derive(Deserialize)]
struct TimeWindowBody {
    #[serde(default, with = "opt_instant")]
    min_starttime: Option<Ms>,
    #[serde(default, with = "opt_instant")]
    max_endtime: Option<Ms>,
}

#[derive(Deserialize)]
struct ResourcesBody {
    resources: Vec<Resource>,
}

#[derive(Deserialize)]
struct ConfigBody {
    #[serde(default)]
    config: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeBody {
    #[serde(with = "instant")]
    lofar_time: Ms,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEventsBody {
    #[serde(default)]
    log_events: Vec<LogEvent>,
}

/// PUT body for a task write. The server checks `id` against the URL.
#[derive(Serialize)]
struct PutTaskBody<'a> {
    id: TaskId,
    #[serde(flatten)]
    patch: &'a TaskPatch,
}

fn transport(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Transport(err.to_string())
    }
}

impl HttpStore {
    pub fn new(base_url: &str, request_timeout: Duration, feed_timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(transport)?;
        Ok(Self {
            client,
            base: base_url.trim_end_matches('/').to_string(),
            request_timeout,
            feed_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest/{path}", self.base)
    }

    /// Send, then map the status: 404 is `NotFound`, other client errors are
    /// refusals carrying the body text.
    async fn send(&self, request: RequestBuilder) -> Result<Vec<u8>, StoreError> {
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport)?;
        if status.is_success() {
            return Ok(body.to_vec());
        }
        Err(match status {
            StatusCode::NOT_FOUND => StoreError::NotFound,
            s if s.is_client_error() => {
                let reason = String::from_utf8_lossy(&body).trim().to_string();
                StoreError::Rejected(if reason.is_empty() { s.to_string() } else { reason })
            }
            s => StoreError::Status(s.as_u16()),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, StoreError> {
        let request = self.client.get(self.url(path)).timeout(self.request_timeout);
        decode(&self.send(request).await?)
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(body)?)
}

fn not_found_as_none<T>(result: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

fn range_path(span: &Span) -> String {
    format!("{}/{}", format_instant(span.start), format_instant(span.end))
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn tasks_in_range(&self, span: Span, project: Option<ProjectId>) -> Result<Vec<Task>, StoreError> {
        let path = match project {
            Some(p) => format!("projects/{p}/tasks/{}", range_path(&span)),
            None => format!("tasks/{}", range_path(&span)),
        };
        Ok(self.get::<TasksBody>(&path).await?.tasks)
    }

    async fn claims_in_range(&self, span: Span) -> Result<Vec<ResourceClaim>, StoreError> {
        let path = format!("resourceclaims/{}", range_path(&span));
        Ok(self.get::<ClaimsBody>(&path).await?.resourceclaims)
    }

    async fn task(&self, key: TaskKey) -> Result<Option<Task>, StoreError> {
        let path = match key {
            TaskKey::Id(id) => format!("tasks/{id}"),
            TaskKey::Otdb(id) => format!("tasks/otdb/{id}"),
            TaskKey::Mom(id) => format!("tasks/mom/{id}"),
        };
        Ok(not_found_as_none(self.get::<TaskBody>(&path).await)?.map(|b| b.task))
    }

    async fn tasks_in_group(&self, group_id: u64) -> Result<Vec<Task>, StoreError> {
        Ok(self.get::<TasksBody>(&format!("tasks/mom/group/{group_id}")).await?.tasks)
    }

    async fn update_task(&self, id: TaskId, patch: &TaskPatch) -> Result<(), StoreError> {
        let request = self
            .client
            .put(self.url(&format!("tasks/{id}")))
            .timeout(self.request_timeout)
            .json(&PutTaskBody { id, patch });
        self.send(request).await.map(|_| ())
    }

    async fn copy_task(&self, id: TaskId) -> Result<(), StoreError> {
        let request = self
            .client
            .put(self.url(&format!("tasks/{id}/copy")))
            .timeout(self.request_timeout);
        self.send(request).await.map(|_| ())
    }

    async fn changes_since(&self, cursor: Option<u64>) -> Result<Vec<ChangeRecord>, StoreError> {
        let path = match cursor {
            Some(cn) => format!("updates/{cn}"),
            None => "updates".to_string(),
        };
        let request = self.client.get(self.url(&path)).timeout(self.feed_timeout);
        Ok(decode::<ChangesBody>(&self.send(request).await?)?.changes)
    }

    async fn most_recent_change_number(&self) -> Result<Option<u64>, StoreError> {
        let body: ChangeNumberBody = self.get("mostRecentChangeNumber").await?;
        // negative means "no changes yet"
        Ok(body.most_recent_change_number.and_then(|n| u64::try_from(n).ok()))
    }

    async fn project_time_window(&self, project: ProjectId) -> Result<Option<Span>, StoreError> {
        let body = not_found_as_none(self.get::<TimeWindowBody>(&format!("projects/{project}/taskstimewindow")).await)?;
        Ok(body.and_then(|b| match (b.min_starttime, b.max_endtime) {
            (Some(start), Some(end)) if start <= end => Some(Span::new(start, end)),
            _ => None,
        }))
    }

    async fn resources(&self) -> Result<Vec<Resource>, StoreError> {
        Ok(self.get::<ResourcesBody>("resources").await?.resources)
    }

    async fn config(&self) -> Result<serde_json::Value, StoreError> {
        Ok(self.get::<ConfigBody>("config").await?.config)
    }

    async fn server_time(&self) -> Result<Ms, StoreError> {
        Ok(self.get::<TimeBody>("lofarTime").await?.lofar_time)
    }

    async fn recent_log_events(&self) -> Result<Vec<LogEvent>, StoreError> {
        let mut events = self.get::<LogEventsBody>("logEvents").await?.log_events;
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_built_under_rest() {
        let store = HttpStore::new("http://scheduler:5000/", Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        assert_eq!(store.url("tasks/4"), "http://scheduler:5000/rest/tasks/4");
        assert_eq!(
            range_path(&Span::new(1451642400000, 1451646000000)),
            "2016-01-01T10:00:00Z/2016-01-01T11:00:00Z"
        );
    }

    #[test]
    fn envelopes_decode() {
        let body: ChangesBody = serde_json::from_str(
            r#"{"changes":[{"changeNumber":5,"objectType":"task","changeType":"insert","value":{"id":9}}]}"#,
        )
        .unwrap();
        assert_eq!(body.changes[0].change_number, 5);

        let cn: ChangeNumberBody = serde_json::from_str(r#"{"mostRecentChangeNumber":-1}"#).unwrap();
        assert_eq!(cn.most_recent_change_number, Some(-1));

        let window: TimeWindowBody = serde_json::from_str(
            r#"{"min_starttime":"2016-01-01T10:00:00","max_endtime":"2016-01-01T11:00:00"}"#,
        )
        .unwrap();
        assert_eq!(window.min_starttime, Some(1451642400000));

        let events: LogEventsBody =
            serde_json::from_str(r#"{"logEvents":[{"value":"hello","timestamp":"2016-01-01T10:00:00"}]}"#).unwrap();
        assert_eq!(events.log_events[0].message, "hello");
    }

    #[test]
    fn put_body_carries_the_url_id() {
        let patch = TaskPatch::reschedule(1451642400000, 1451646000000);
        let body = serde_json::to_value(PutTaskBody { id: 42, patch: &patch }).unwrap();
        assert_eq!(body["id"], 42);
        assert_eq!(body["starttime"], "2016-01-01T10:00:00Z");
        assert!(body.get("status").is_none());
    }

    #[test]
    fn not_found_maps_to_none() {
        assert_eq!(not_found_as_none::<u8>(Err(StoreError::NotFound)), Ok(None));
        assert!(not_found_as_none::<u8>(Err(StoreError::Timeout)).is_err());
    }
}
