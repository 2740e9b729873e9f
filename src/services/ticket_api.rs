use chrono::{DateTime, Utc};
use reqwest::{multipart, Client, Response};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use strum::Display;
use uuid::Uuid;

use crate::models::action::ExtrasPayload;
use crate::models::photo_job::LocationSnapshot;

#[derive(Debug, Clone, Copy, Serialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TicketStatus {
    Started,
    Stopped,
    Cancelled,
}

/// Body of the ticket status update, linking the ticket to its trip.
#[derive(Debug, Clone, Serialize)]
pub struct TicketStatusUpdate {
    pub status: TicketStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<Uuid>,
    pub changed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Client for the ticket/trip backend.
pub struct TicketApiClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

impl TicketApiClient {
    pub fn new(base_url: &str, api_token: Option<String>) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// PUT /ticket/{ticket_id}/status
    pub async fn update_ticket_status(
        &self,
        ticket_id: &str,
        update: &TicketStatusUpdate,
    ) -> Result<(), ApiError> {
        let url = format!("{}/ticket/{}/status", self.base_url, ticket_id);
        let response = self.authorize(self.http.put(&url)).json(update).send().await?;
        check_status(response).await
    }

    /// POST /ticket/{ticket_id}/extras
    pub async fn post_extras(&self, ticket_id: &str, extras: &ExtrasPayload) -> Result<(), ApiError> {
        let url = format!("{}/ticket/{}/extras", self.base_url, ticket_id);
        let response = self.authorize(self.http.post(&url)).json(extras).send().await?;
        check_status(response).await
    }

    /// POST /ticket/photos/upload/{ticket_id} with every photo as a `photos[]` part.
    pub async fn upload_photos(
        &self,
        ticket_id: &str,
        user_id: &str,
        photos: &[PathBuf],
    ) -> Result<(), ApiError> {
        let mut form = multipart::Form::new();
        for path in photos {
            let bytes = tokio::fs::read(path).await?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "photo.jpg".to_string());
            let part = multipart::Part::bytes(bytes)
                .file_name(file_name)
                .mime_str("image/jpeg")?;
            form = form.part("photos[]", part);
        }

        let url = format!("{}/ticket/photos/upload/{}", self.base_url, ticket_id);
        let response = self
            .authorize(self.http.post(&url))
            .header("user_id", user_id)
            .multipart(form)
            .send()
            .await?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<(), ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let message = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to read upload file: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Short message suitable for showing to a field worker.
    pub fn summary(&self) -> String {
        match self {
            ApiError::Status { status: 401 | 403, message } if !message.is_empty() => message.clone(),
            ApiError::Status { status: 401 | 403, .. } => "Session expired, please sign in again".to_string(),
            ApiError::Status { status, .. } => format!("Server rejected the request (HTTP {status})"),
            ApiError::Http(_) => "Network unavailable, will retry when back online".to_string(),
            ApiError::Io(_) => "A photo file could not be read".to_string(),
        }
    }
}
