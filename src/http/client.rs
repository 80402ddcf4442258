use crate::trace::SessionTrace;
use reqwest::{Client, Url};
use serde::Serialize;
use std::fmt;

const REDACTION: &str = "***REDACTED***";
const SECRET_QUERY_KEYS: [&str; 3] = ["key", "api_key", "access_token"];

/// reqwest wrapper that mirrors every exchange into the session trace.
#[derive(Clone)]
pub struct HttpClient {
    inner: Client,
    trace: Option<SessionTrace>,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("traced", &self.trace.is_some())
            .finish()
    }
}

impl HttpClient {
    pub fn new(inner: Client) -> Self {
        Self { inner, trace: None }
    }

    pub fn with_trace(mut self, trace: SessionTrace) -> Self {
        self.trace = Some(trace);
        self
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        payload: &T,
    ) -> Result<HttpResponseData, reqwest::Error> {
        let request = self.inner.post(url).query(query).json(payload).build()?;
        if let Some(trace) = &self.trace {
            let body_json = serde_json::to_string(payload)
                .unwrap_or_else(|err| format!("{{\"_serialization_error\":\"{err}\"}}"));
            trace.log_http_request(
                request.method().as_str(),
                &redact_url(request.url()),
                &body_json,
            );
        }

        let response = match self.inner.execute(request).await {
            Ok(response) => response,
            Err(err) => {
                if let Some(trace) = &self.trace {
                    trace.log_http_error(&err.to_string());
                }
                return Err(err);
            }
        };
        let status = response.status().as_u16();
        let body = response.text().await?;

        if let Some(trace) = &self.trace {
            trace.log_http_response(status, &body);
        }

        Ok(HttpResponseData { status, body })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseData {
    pub status: u16,
    pub body: String,
}

pub(crate) fn redact_url(url: &Url) -> String {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            if SECRET_QUERY_KEYS.contains(&k.to_ascii_lowercase().as_str()) {
                (k.into_owned(), REDACTION.to_string())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();

    let mut redacted = url.clone();
    redacted.set_query(None);
    if !pairs.is_empty() {
        let mut qp = redacted.query_pairs_mut();
        for (k, v) in pairs {
            qp.append_pair(&k, &v);
        }
    }

    // Keep the marker readable in trace files.
    redacted.as_str().replace("%2A%2A%2AREDACTED%2A%2A%2A", REDACTION)
}

#[cfg(test)]
mod tests {
    use super::{HttpClient, HttpResponseData, redact_url};
    use crate::trace::SessionTrace;
    use reqwest::{Client, Url};
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn redact_url_masks_api_key_only() {
        let url = Url::parse("https://example.com/v1?key=super-secret&alt=json").expect("url");
        let redacted = redact_url(&url);
        assert_eq!(redacted, "https://example.com/v1?key=***REDACTED***&alt=json");
    }

    #[tokio::test]
    async fn post_json_returns_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/test"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = HttpClient::new(Client::new());
        let response = client
            .post_json(&format!("{}/v1/test", server.uri()), &[], &json!({"ok": true}))
            .await
            .expect("request should complete");

        assert_eq!(
            response,
            HttpResponseData {
                status: 503,
                body: "overloaded".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn post_json_traces_exchange_without_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/test"))
            .and(query_param("key", "super-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let trace = SessionTrace::create_in_temp_dir("test-session", dir.path()).expect("trace");
        let client = HttpClient::new(Client::new()).with_trace(trace.clone());

        client
            .post_json(
                &format!("{}/v1/test", server.uri()),
                &[("key", "super-secret")],
                &json!({"question": "ctr?"}),
            )
            .await
            .expect("request should succeed");

        let trace_text = fs::read_to_string(trace.file_path()).expect("read trace file");
        assert!(trace_text.contains("[ai.http.in ] POST"));
        assert!(trace_text.contains("key=***REDACTED***"));
        assert!(trace_text.contains("\"question\":\"ctr?\""));
        assert!(trace_text.contains("[ai.http.out] HTTP 200"));
        assert!(!trace_text.contains("super-secret"));
    }
}
