//! Executor that forwards tasks to the CRUD backend over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{Value, json};
use tracing::{info, warn};

use mindcast_core::error::{MindcastError, Result};
use mindcast_core::protocol::{Task, TaskResult, actions};

use crate::executor::TaskExecutor;

pub struct HttpTaskExecutor {
    client: reqwest::Client,
    backend_url: String,
}

impl HttpTaskExecutor {
    pub fn new(backend_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MindcastError::Executor(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            backend_url: backend_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.backend_url.trim_end_matches('/'))
    }

    fn request_for(&self, task: &Task) -> Option<RequestBuilder> {
        let field = |key: &str, default: Value| task.data.get(key).cloned().unwrap_or(default);

        let request = match task.action.as_str() {
            actions::UPSERT_MIND => self
                .client
                .post(self.url("/api/upsert_mind"))
                .json(&task.data),
            actions::GET_MIND => self
                .client
                .post(self.url("/api/get_mind"))
                .json(&json!({ "mind_id_list": field("mind_id_list", json!([])) })),
            actions::LIST_MINDS => self.client.get(self.url("/api/minds")),
            actions::APPEND_MENTAL | actions::REMOVE_MENTAL => self
                .client
                .post(self.url(&format!("/api/{}", task.action)))
                .json(&json!({
                    "mind_id": field("mind_id", Value::Null),
                    "sphere_id": field("sphere_id", json!([])),
                })),
            _ => return None,
        };
        Some(request)
    }

    async fn forward(&self, task: &Task, request: RequestBuilder) -> TaskResult {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id = %task.request_id, %e, "Backend request failed");
                return TaskResult::error(task, e.to_string());
            }
        };

        let status = response.status();
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(request_id = %task.request_id, %status, %e, "Backend returned a non-JSON body");
                return TaskResult::error(task, format!("Invalid backend response: {e}"));
            }
        };

        // The backend answers 200 for every successful action.
        if status == StatusCode::OK {
            TaskResult::success(task, body)
        } else {
            let detail = match body.get("detail") {
                Some(Value::String(detail)) => detail.clone(),
                Some(other) => other.to_string(),
                None => "Unknown error".to_string(),
            };
            TaskResult::error(task, detail)
        }
    }
}

#[async_trait]
impl TaskExecutor for HttpTaskExecutor {
    async fn execute(&self, task: &Task) -> TaskResult {
        let Some(request) = self.request_for(task) else {
            warn!(action = %task.action, request_id = %task.request_id, "Unknown action");
            return TaskResult::error(task, format!("Unknown action: {}", task.action));
        };
        info!(action = %task.action, request_id = %task.request_id, "Processing task");
        self.forward(task, request).await
    }
}
