//! HTTP implementation of the server collaborators.

use std::time::Duration;

use async_trait::async_trait;
use planvault_core::protocol::{
    ConflictResponse, CreateShareRequest, CreateShareResponse, ErrorResponse, IncomingShare,
    OutgoingShare, OwnedShare, PatchShareRequest, PublicKeyResponse, PublishKeyRequest,
    PushRecord, SaveWorkspaceRequest, ShareView, VersionResponse, WorkspaceResponse,
    WriteShareRequest,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::api::{ApiResult, SaveOutcome, ShareApi, WorkspaceApi};
use crate::config::SyncConfig;
use crate::error::ApiError;

const MAX_LOG_BODY_CHARS: usize = 256;

/// Bearer-authenticated client for one user session
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
}

impl HttpClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> ApiResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ApiError::InvalidRequest("Invalid access token format".to_string()))?;
        headers.insert(AUTHORIZATION, auth_value);

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
        })
    }

    pub fn from_config(config: &SyncConfig, token: &str) -> ApiResult<Self> {
        Self::new(&config.server_url, token, config.request_timeout())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn log_response(status: StatusCode, body: &str) {
        if status.is_success() {
            debug!("API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("API response error ({}): {}", status, preview);
    }

    /// Turn a non-success response into an [`ApiError`]
    fn error_from(status: StatusCode, body: &str) -> ApiError {
        if status == StatusCode::CONFLICT {
            if let Ok(conflict) = serde_json::from_str::<ConflictResponse>(body) {
                return ApiError::Conflict {
                    current_version: conflict.current_version,
                };
            }
        }
        match serde_json::from_str::<ErrorResponse>(body) {
            Ok(error) => ApiError::api(status.as_u16(), error.error),
            Err(_) => ApiError::api(status.as_u16(), format!("Request failed: {}", body)),
        }
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> ApiResult<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            return Err(Self::error_from(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| {
            tracing::error!("Failed to deserialize response: {}", e);
            ApiError::api(status.as_u16(), format!("Failed to parse response: {}", e))
        })
    }

    /// For endpoints answering 204 No Content
    async fn parse_empty(response: reqwest::Response) -> ApiResult<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await?;
        Self::log_response(status, &body);
        Err(Self::error_from(status, &body))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        let response = self
            .client
            .get(self.url(path))
            .headers(self.headers.clone())
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Send a compare-and-swap write and fold a 409 into [`SaveOutcome`]
    async fn cas(&self, request: reqwest::RequestBuilder) -> ApiResult<SaveOutcome> {
        let response = request.headers(self.headers.clone()).send().await?;
        let result = Self::parse_response::<VersionResponse>(response)
            .await
            .map(|r| r.version);
        SaveOutcome::from_result(result)
    }
}

#[async_trait]
impl WorkspaceApi for HttpClient {
    async fn version(&self) -> ApiResult<i64> {
        let response: VersionResponse = self.get("/workspace/version").await?;
        Ok(response.version)
    }

    async fn fetch(&self) -> ApiResult<WorkspaceResponse> {
        self.get("/workspace").await
    }

    async fn save(&self, data: &str, expected_version: i64) -> ApiResult<SaveOutcome> {
        let body = SaveWorkspaceRequest {
            data: data.to_string(),
            expected_version,
        };
        self.cas(self.client.post(self.url("/workspace")).json(&body))
            .await
    }
}

#[async_trait]
impl ShareApi for HttpClient {
    async fn create_share(&self, request: &CreateShareRequest) -> ApiResult<CreateShareResponse> {
        let response = self
            .client
            .post(self.url("/shares"))
            .headers(self.headers.clone())
            .json(request)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn incoming(&self) -> ApiResult<Vec<IncomingShare>> {
        self.get("/shares/incoming").await
    }

    async fn owned(&self) -> ApiResult<Vec<OwnedShare>> {
        self.get("/shares/owned").await
    }

    async fn outgoing(&self) -> ApiResult<Vec<OutgoingShare>> {
        self.get("/shares/outgoing").await
    }

    async fn share(&self, share_id: Uuid) -> ApiResult<ShareView> {
        self.get(&format!("/shares/{}", share_id)).await
    }

    async fn write(&self, share_id: Uuid, request: &WriteShareRequest) -> ApiResult<SaveOutcome> {
        let url = self.url(&format!("/shares/{}", share_id));
        self.cas(self.client.put(url).json(request)).await
    }

    async fn resolve(
        &self,
        share_id: Uuid,
        request: &WriteShareRequest,
    ) -> ApiResult<SaveOutcome> {
        let url = self.url(&format!("/shares/{}/resolve", share_id));
        self.cas(self.client.post(url).json(request)).await
    }

    async fn pending_pushes(&self, share_id: Uuid) -> ApiResult<Vec<PushRecord>> {
        self.get(&format!("/shares/{}/pushes", share_id)).await
    }

    async fn patch(&self, share_id: Uuid, request: &PatchShareRequest) -> ApiResult<()> {
        let response = self
            .client
            .patch(self.url(&format!("/shares/{}", share_id)))
            .headers(self.headers.clone())
            .json(request)
            .send()
            .await?;
        Self::parse_empty(response).await
    }

    async fn delete(&self, share_id: Uuid) -> ApiResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/shares/{}", share_id)))
            .headers(self.headers.clone())
            .send()
            .await?;
        Self::parse_empty(response).await
    }

    async fn publish_key(&self, public_key: &str) -> ApiResult<()> {
        let body = PublishKeyRequest {
            public_key: public_key.to_string(),
        };
        let response = self
            .client
            .put(self.url("/keys"))
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .await?;
        Self::parse_empty(response).await
    }

    async fn lookup_key(&self, email: &str) -> ApiResult<PublicKeyResponse> {
        self.get(&format!("/keys/{}", urlencoding::encode(email)))
            .await
    }
}
