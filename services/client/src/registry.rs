//! Client half of the registry RPCs.

use kh_proto::{
    ErrorFrame, HostOnlineRequest, HostQueryRequest, HostQueryResponse, HostUpdateRequest,
};
use std::time::Duration;

const RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("RPC timed out")]
    Timeout,
    #[error("registry rejected request: {0}")]
    Rejected(String),
}

pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(base_url: &str) -> Self {
        let trimmed = base_url.trim_end_matches('/');
        let base_url = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_owned()
        } else {
            format!("http://{trimmed}")
        };
        RegistryClient {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    async fn post<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        req: &Req,
    ) -> Result<Resp, RegistryError> {
        let url = format!("{}{}", self.base_url, path);
        let response = tokio::time::timeout(RPC_TIMEOUT, self.http.post(&url).json(req).send())
            .await
            .map_err(|_| RegistryError::Timeout)??;
        if !response.status().is_success() {
            let status = response.status().to_string();
            let body: ErrorFrame = response.json().await.unwrap_or(ErrorFrame {
                code: status,
                message: String::new(),
            });
            return Err(RegistryError::Rejected(body.code));
        }
        Ok(response.json().await?)
    }

    pub async fn host_online(&self, req: &HostOnlineRequest) -> Result<(), RegistryError> {
        let _: kh_proto::HostOnlineResponse = self.post("/api/v1/host-online", req).await?;
        Ok(())
    }

    pub async fn host_update(&self, req: &HostUpdateRequest) -> Result<(), RegistryError> {
        let _: kh_proto::HostUpdateResponse = self.post("/api/v1/host-update", req).await?;
        Ok(())
    }

    pub async fn host_query(
        &self,
        req: &HostQueryRequest,
    ) -> Result<HostQueryResponse, RegistryError> {
        self.post("/api/v1/host-query", req).await
    }
}
