use reqwest::{Client, Response};
use serde_json::Value;
use tokio::time::Duration;

use crate::constants::USER_AGENT;

pub const GENERATE_CONTENT: &str = "generateContent";
pub const STREAM_GENERATE_CONTENT: &str = "streamGenerateContent";

// Thin HTTP edge for the Cloud Code internal API. The dispatcher owns the
// endpoint walk; this client only knows how to shape a single call.
pub struct UpstreamClient {
    http: Client,
    endpoints: Vec<String>,
}

impl UpstreamClient {
    pub fn new(endpoints: Vec<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(600))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { http, endpoints }
    }

    // Ordered roster of base URLs, tried in order per dispatch attempt.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn build_url(base_url: &str, method: &str, query_string: Option<&str>) -> String {
        match query_string {
            Some(qs) => format!("{}:{}?{}", base_url, method, qs),
            None => format!("{}:{}", base_url, method),
        }
    }

    pub async fn generate_content(
        &self,
        base_url: &str,
        access_token: &str,
        body: &Value,
    ) -> Result<Response, reqwest::Error> {
        let url = Self::build_url(base_url, GENERATE_CONTENT, None);
        self.http
            .post(&url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .header("x-goog-api-client", "gl-rust/cloudcode")
            .json(body)
            .send()
            .await
    }

    pub async fn stream_generate_content(
        &self,
        base_url: &str,
        access_token: &str,
        body: &Value,
    ) -> Result<Response, reqwest::Error> {
        let url = Self::build_url(base_url, STREAM_GENERATE_CONTENT, Some("alt=sse"));
        self.http
            .post(&url)
            .bearer_auth(access_token)
            .header("Accept", "text/event-stream")
            .header("x-goog-api-client", "gl-rust/cloudcode")
            .json(body)
            .send()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_with_and_without_query() {
        let base = "https://cloudcode-pa.googleapis.com/v1internal";
        assert_eq!(
            UpstreamClient::build_url(base, GENERATE_CONTENT, None),
            "https://cloudcode-pa.googleapis.com/v1internal:generateContent"
        );
        assert_eq!(
            UpstreamClient::build_url(base, STREAM_GENERATE_CONTENT, Some("alt=sse")),
            "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn roster_preserves_configured_order() {
        let client = UpstreamClient::new(vec![
            "https://one.example/v1internal".to_string(),
            "https://two.example/v1internal".to_string(),
        ]);
        assert_eq!(client.endpoints().len(), 2);
        assert!(client.endpoints()[0].contains("one.example"));
    }
}
