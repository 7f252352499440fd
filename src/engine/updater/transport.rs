//! Update Transport
//!
//! The agent's only view of the distribution endpoint. `HttpTransport` speaks
//! the JSON wire protocol over reqwest; tests substitute in-process
//! implementations.

use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::CONTENT_LENGTH;
use std::future::Future;

use super::AgentError;
use crate::engine::protocol::{
    CheckUpdateRequest, CheckUpdateResponse, ReportInstallRequest, DEPLOYMENT_KEY_HEADER,
};

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, AgentError>>;

/// Response to a package request: advertised length (if any) and the body
pub struct PackageBody {
    pub content_length: Option<u64>,
    pub stream: ByteStream,
}

pub trait UpdateTransport: Send + Sync {
    fn check_update(
        &self,
        request: &CheckUpdateRequest,
    ) -> impl Future<Output = Result<CheckUpdateResponse, AgentError>> + Send;

    fn download(&self, url: &str) -> impl Future<Output = Result<PackageBody, AgentError>> + Send;

    fn report_install(
        &self,
        report: &ReportInstallRequest,
    ) -> impl Future<Output = Result<(), AgentError>> + Send;
}

pub struct HttpTransport {
    client: reqwest::Client,
    server_url: String,
    deployment_key: String,
}

impl HttpTransport {
    pub fn new(server_url: &str, deployment_key: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hotpush-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
            deployment_key: deployment_key.to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.server_url, path)
    }
}

fn network(e: reqwest::Error) -> AgentError {
    AgentError::Network(e.to_string())
}

fn check_status(response: &reqwest::Response) -> Result<(), AgentError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(AgentError::Network(format!("HTTP {}", response.status())))
    }
}

impl UpdateTransport for HttpTransport {
    async fn check_update(
        &self,
        request: &CheckUpdateRequest,
    ) -> Result<CheckUpdateResponse, AgentError> {
        let response = self
            .client
            .post(self.endpoint("/api/check-update"))
            .header(DEPLOYMENT_KEY_HEADER, &self.deployment_key)
            .json(request)
            .send()
            .await
            .map_err(network)?;
        check_status(&response)?;
        response.json().await.map_err(network)
    }

    async fn download(&self, url: &str) -> Result<PackageBody, AgentError> {
        let response = self
            .client
            .get(url)
            .header(DEPLOYMENT_KEY_HEADER, &self.deployment_key)
            .send()
            .await
            .map_err(network)?;
        check_status(&response)?;

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let stream = response
            .bytes_stream()
            .map_ok(|chunk| chunk.to_vec())
            .map_err(network)
            .boxed();
        Ok(PackageBody {
            content_length,
            stream,
        })
    }

    async fn report_install(&self, report: &ReportInstallRequest) -> Result<(), AgentError> {
        let response = self
            .client
            .post(self.endpoint("/api/report-install"))
            .json(report)
            .send()
            .await
            .map_err(network)?;
        check_status(&response)
    }
}
