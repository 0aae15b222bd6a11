//! HTTP implementation of the Remote Gateway using reqwest.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

use crate::error::{NoteSyncError, NoteSyncResult};
use crate::gateway::{
    ConflictBody, CreateNoteRequest, GatewayError, RemoteGateway, RemoteNote, UpdateNoteRequest,
};

/// Connection settings for the note backend.
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    /// Base URL, e.g. `https://api.example.com/v1`
    pub base_url: String,
    /// Bearer token issued by the auth subsystem
    pub access_token: String,
    /// Sent as `X-Device-Id` so the server can attribute edits
    pub device_id: String,
    pub timeout: Duration,
}

/// Remote Gateway backed by the REST note API.
pub struct HttpGateway {
    client: Client,
    config: HttpGatewayConfig,
}

impl HttpGateway {
    /// Create a new gateway
    pub fn new(config: HttpGatewayConfig) -> NoteSyncResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(NoteSyncError::Config("api_base_url is not set".to_string()));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| NoteSyncError::Network(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn note_url(&self, remote_id: &str) -> String {
        self.url(&format!("/notes/{}", urlencoding::encode(remote_id)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.config.access_token)
            .header("X-Device-Id", &self.config.device_id)
    }
}

fn network_error(err: reqwest::Error) -> GatewayError {
    GatewayError::Network(err.to_string())
}

async fn status_error(response: Response) -> GatewayError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|e| format!("unreadable body: {}", e));
    GatewayError::Status { status, message }
}

async fn decode_note(response: Response) -> Result<RemoteNote, GatewayError> {
    response
        .json::<RemoteNote>()
        .await
        .map_err(|e| GatewayError::Decode(format!("Failed to parse note: {}", e)))
}

impl RemoteGateway for HttpGateway {
    async fn create_note(&self, request: &CreateNoteRequest) -> Result<RemoteNote, GatewayError> {
        let response = self
            .authorize(self.client.post(self.url("/notes")))
            .json(request)
            .send()
            .await
            .map_err(network_error)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        decode_note(response).await
    }

    async fn update_note(
        &self,
        remote_id: &str,
        request: &UpdateNoteRequest,
    ) -> Result<RemoteNote, GatewayError> {
        let response = self
            .authorize(self.client.put(self.note_url(remote_id)))
            .json(request)
            .send()
            .await
            .map_err(network_error)?;

        if response.status() == StatusCode::CONFLICT {
            let body: ConflictBody = response
                .json()
                .await
                .map_err(|e| GatewayError::Decode(format!("Failed to parse conflict: {}", e)))?;
            return Err(GatewayError::VersionConflict(Box::new(body.remote_note)));
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        decode_note(response).await
    }

    async fn delete_note(&self, remote_id: &str) -> Result<(), GatewayError> {
        let response = self
            .authorize(self.client.delete(self.note_url(remote_id)))
            .send()
            .await
            .map_err(network_error)?;

        // Already gone on the server: the tombstone is satisfied.
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error(response).await)
    }

    async fn list_notes(&self) -> Result<Vec<RemoteNote>, GatewayError> {
        let response = self
            .authorize(self.client.get(self.url("/notes")))
            .send()
            .await
            .map_err(network_error)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response
            .json::<Vec<RemoteNote>>()
            .await
            .map_err(|e| GatewayError::Decode(format!("Failed to parse note list: {}", e)))
    }
}
