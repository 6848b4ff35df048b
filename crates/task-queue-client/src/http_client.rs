use crate::{ClientError, ClientSettings, Result, TaskQueueService};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use task_queue_core::{Task, TaskResult};
use tracing::debug;

const AUTH_HEADER: &str = "X-Authorization";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    key_id: &'a str,
    key_secret: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// HTTP client for the remote task queue service
pub struct TaskQueueHttpClient {
    settings: ClientSettings,
    http: Client,
    token: RwLock<Option<String>>,
}

impl TaskQueueHttpClient {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()?;

        Ok(TaskQueueHttpClient {
            settings,
            http,
            token: RwLock::new(None),
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Endpoint below the base URL, one percent-encoded path segment each
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let invalid = || ClientError::InvalidUrl(self.settings.server_url.clone());
        let mut url = Url::parse(self.settings.base_url()).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Return the cached token, fetching a new one if auth is configured
    async fn token(&self) -> Result<Option<String>> {
        let (key, secret) = match (&self.settings.auth_key, &self.settings.auth_secret) {
            (Some(key), Some(secret)) => (key, secret),
            _ => return Ok(None),
        };

        if let Some(token) = self.token.read().clone() {
            return Ok(Some(token));
        }

        debug!("Requesting auth token from {}", self.settings.base_url());
        let response = self
            .http
            .post(self.url(&["token"])?)
            .json(&TokenRequest {
                key_id: key,
                key_secret: secret,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Authentication(format!("{}: {}", status, body)));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?
            .token;

        *self.token.write() = Some(token.clone());
        Ok(Some(token))
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        Ok(match self.token().await? {
            Some(token) => request.header(AUTH_HEADER, token),
            None => request,
        })
    }

    /// Turn a non-success status into an error, dropping a rejected token
    async fn check(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.token.write().take();
        }

        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl TaskQueueService for TaskQueueHttpClient {
    async fn poll(
        &self,
        task_type: &str,
        worker_id: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Option<Task>> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(worker_id) = worker_id {
            query.push(("workerid", worker_id));
        }
        if let Some(domain) = domain {
            query.push(("domain", domain));
        }

        let request = self
            .http
            .get(self.url(&["tasks", "poll", task_type])?)
            .query(&query);
        let response = self.authorized(request).await?.send().await?;
        let response = self.check(response).await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let task = Task::from_json(&body).map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(Some(task))
    }

    async fn update(&self, result: &TaskResult) -> Result<String> {
        let request = self.http.post(self.url(&["tasks"])?).json(result);
        let response = self.authorized(request).await?.send().await?;
        let response = self.check(response).await?;

        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    /// Answer one connection per canned response and record each request,
    /// lowercased. Returns the base URL.
    async fn serve(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/api", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            for canned in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = stream.read(&mut buf).await.unwrap();
                    request.extend_from_slice(&buf[..n]);
                    if n == 0 || request_complete(&request) {
                        break;
                    }
                }
                recorded
                    .lock()
                    .push(String::from_utf8_lossy(&request).to_lowercase());
                stream.write_all(canned.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
        });

        (base, requests)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request).to_lowercase();
        let Some(head_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let body_len = text[..head_end]
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|len| len.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= head_end + 4 + body_len
    }

    #[test]
    fn test_url_building() {
        let settings = ClientSettings::new("http://queue:8080/api/");
        let client = TaskQueueHttpClient::new(settings).unwrap();
        assert_eq!(
            client.url(&["tasks"]).unwrap().as_str(),
            "http://queue:8080/api/tasks"
        );
        assert_eq!(
            client.url(&["tasks", "poll", "send email/v2"]).unwrap().as_str(),
            "http://queue:8080/api/tasks/poll/send%20email%2Fv2"
        );
    }

    #[test]
    fn test_bad_server_url() {
        let client = TaskQueueHttpClient::new(ClientSettings::new("not a url")).unwrap();
        assert!(matches!(client.url(&["tasks"]), Err(ClientError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_no_token_without_credentials() {
        let client = TaskQueueHttpClient::new(ClientSettings::default()).unwrap();
        assert!(client.token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_content_is_no_task() {
        let (base, requests) = serve(vec![
            response("204 No Content", ""),
            response("200 OK", "  "),
        ])
        .await;
        let client = TaskQueueHttpClient::new(ClientSettings::new(base)).unwrap();

        assert!(client.poll("echo", Some("w-1"), Some("blue")).await.unwrap().is_none());
        assert!(client.poll("echo", Some("w-1"), None).await.unwrap().is_none());

        let requests = requests.lock();
        assert!(requests[0]
            .starts_with("get /api/tasks/poll/echo?workerid=w-1&domain=blue http/1.1"));
        assert!(requests[1].starts_with("get /api/tasks/poll/echo?workerid=w-1 http/1.1"));
    }

    #[tokio::test]
    async fn test_poll_returns_task() {
        let body = r#"{"taskId":"t-1","workflowInstanceId":"wf-1","taskType":"echo","inputData":{"x":21}}"#;
        let (base, _) = serve(vec![response("200 OK", body)]).await;
        let client = TaskQueueHttpClient::new(ClientSettings::new(base)).unwrap();

        let task = client.poll("echo", None, None).await.unwrap().unwrap();
        assert_eq!(task.task_id, "t-1");
        assert_eq!(task.workflow_instance_id, "wf-1");
        assert_eq!(task.input_data["x"], 21);
    }

    #[tokio::test]
    async fn test_task_type_is_percent_encoded() {
        let (base, requests) = serve(vec![response("204 No Content", "")]).await;
        let client = TaskQueueHttpClient::new(ClientSettings::new(base)).unwrap();

        client.poll("send email/v2", None, None).await.unwrap();
        assert!(requests.lock()[0].starts_with("get /api/tasks/poll/send%20email%2fv2 http/1.1"));
    }

    #[tokio::test]
    async fn test_rejected_token_is_refreshed() {
        let (base, requests) = serve(vec![
            response("200 OK", r#"{"token":"first"}"#),
            response("401 Unauthorized", "expired"),
            response("200 OK", r#"{"token":"second"}"#),
            response("204 No Content", ""),
        ])
        .await;
        let settings = ClientSettings::new(base).with_auth("k", "s");
        let client = TaskQueueHttpClient::new(settings).unwrap();

        match client.poll("echo", None, None).await {
            Err(ClientError::Api { status: 401, body }) => assert_eq!(body, "expired"),
            other => panic!("Expected 401, got {:?}", other.map(|_| ())),
        }
        assert!(client.token.read().is_none());

        assert!(client.poll("echo", None, None).await.unwrap().is_none());

        let requests = requests.lock();
        assert!(requests[0].starts_with("post /api/token"));
        assert!(requests[0].contains(r#""keyid":"k""#));
        assert!(requests[1].contains("x-authorization: first"));
        assert!(requests[2].starts_with("post /api/token"));
        assert!(requests[3].contains("x-authorization: second"));
    }

    #[tokio::test]
    async fn test_update_returns_body() {
        let (base, requests) = serve(vec![response("200 OK", "t-1")]).await;
        let client = TaskQueueHttpClient::new(ClientSettings::new(base)).unwrap();

        let result = TaskResult::new("t-1", "wf-1").complete();
        assert_eq!(client.update(&result).await.unwrap(), "t-1");
        assert!(requests.lock()[0].starts_with("post /api/tasks http/1.1"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let mut settings = ClientSettings::new("http://127.0.0.1:9/api");
        settings.request_timeout_ms = 500;
        let client = TaskQueueHttpClient::new(settings).unwrap();

        let result = client.poll("echo", Some("w-1"), None).await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }
}
