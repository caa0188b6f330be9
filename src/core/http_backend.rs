use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Response, Url};
use tracing::debug;

use crate::api::models::sort_models;
use crate::api::{
    HistoryEntry, HistoryResponse, ModelsResponse, SessionInitRequest, SessionInitResponse,
};
use crate::core::chat_stream::format_api_error;
use crate::core::transport::{BackendError, ByteStream, ChatBackend, Transport, TransportError};
use crate::utils::url::{construct_api_url, resource_url};

/// `reqwest` client for the local model server.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn session_messages_url(&self, session_id: &str) -> Result<Url, BackendError> {
        resource_url(&self.base_url, "sessions", session_id, &["messages"])
            .map_err(BackendError::Decode)
    }
}

async fn ensure_success(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "<no body>".to_string());
    Err(TransportError::Status {
        status: status.as_u16(),
        message: format_api_error(&error_text),
    })
}

fn connect_error(err: reqwest::Error) -> TransportError {
    TransportError::Connect(err.to_string())
}

fn decode_error(err: reqwest::Error) -> BackendError {
    BackendError::Decode(err.to_string())
}

#[async_trait]
impl Transport for HttpBackend {
    async fn open_stream(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<ByteStream, TransportError> {
        debug!(url = %url, "Opening response stream");
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(connect_error)?;
        let response = ensure_success(response).await?;

        let bytes = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|err| TransportError::Body(err.to_string()))
        });
        Ok(Box::pin(bytes))
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn init_session(&self, model: &str) -> Result<SessionInitResponse, BackendError> {
        let url = construct_api_url(&self.base_url, "sessions");
        let response = self
            .client
            .post(url)
            .json(&SessionInitRequest {
                model: model.to_string(),
            })
            .send()
            .await
            .map_err(connect_error)?;
        let response = ensure_success(response).await?;
        response.json::<SessionInitResponse>().await.map_err(decode_error)
    }

    async fn fetch_history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, BackendError> {
        let url = self.session_messages_url(session_id)?;
        let response = self.client.get(url).send().await.map_err(connect_error)?;
        let response = ensure_success(response).await?;
        let history = response
            .json::<HistoryResponse>()
            .await
            .map_err(decode_error)?;
        Ok(history.into_entries())
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let url = construct_api_url(&self.base_url, "models");
        let response = self.client.get(url).send().await.map_err(connect_error)?;
        let response = ensure_success(response).await?;
        let mut models = response
            .json::<ModelsResponse>()
            .await
            .map_err(decode_error)?
            .data;
        sort_models(&mut models);
        Ok(models.into_iter().map(|model| model.id).collect())
    }

    fn chat_url(&self) -> String {
        construct_api_url(&self.base_url, "chat")
    }
}
