//! Call-record REST collaborator.
//!
//! The server keeps a persistent record of every call; the manager hits these
//! endpoints around its own signaling so server-side records stay consistent
//! with client-side state. Only success/failure and the authoritative call id
//! from `initiate` matter here.

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CallId, MediaKind, UserId};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("call record request failed: {0}")]
    Http(String),

    #[error("call record server returned status {0}")]
    Status(u16),

    #[error("malformed call record response: {0}")]
    Decode(String),
}

/// Call-record lifecycle endpoints.
#[async_trait]
pub trait CallRecordApi: Send + Sync {
    /// Create the server-side record. Returns the authoritative call id,
    /// which may differ from the locally generated one.
    async fn initiate(
        &self,
        call_id: &CallId,
        callee: &UserId,
        media_kind: MediaKind,
    ) -> Result<CallId, ApiError>;

    async fn accept(&self, call_id: &CallId) -> Result<(), ApiError>;
    async fn reject(&self, call_id: &CallId) -> Result<(), ApiError>;
    async fn end(&self, call_id: &CallId) -> Result<(), ApiError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitiateRequest<'a> {
    call_id: &'a CallId,
    callee_id: &'a UserId,
    media_kind: MediaKind,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateResponse {
    call_id: CallId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CallIdRequest<'a> {
    call_id: &'a CallId,
}

/// HTTP implementation of [`CallRecordApi`].
pub struct HttpCallRecordApi {
    base_url: String,
    bearer: String,
}

impl HttpCallRecordApi {
    pub fn new(base_url: impl Into<String>, bearer: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            bearer: bearer.into(),
        }
    }

    fn endpoint(&self, action: &str) -> String {
        format!("{}/calls/{}", self.base_url, action)
    }

    // ureq is blocking, so every request runs on the blocking pool.
    async fn post<B, R>(&self, action: &str, body: B) -> Result<R, ApiError>
    where
        B: Serialize + Send + 'static,
        R: serde::de::DeserializeOwned + Send + 'static,
    {
        let url = self.endpoint(action);
        let authorization = format!("Bearer {}", self.bearer);
        debug!("call record request: POST {url}");

        tokio::task::spawn_blocking(move || {
            let mut response = ureq::post(&url)
                .header("Authorization", &authorization)
                .send_json(&body)
                .map_err(|e| match e {
                    ureq::Error::StatusCode(code) => ApiError::Status(code),
                    other => ApiError::Http(other.to_string()),
                })?;
            response
                .body_mut()
                .read_json::<R>()
                .map_err(|e| ApiError::Decode(e.to_string()))
        })
        .await
        .map_err(|e| ApiError::Http(e.to_string()))?
    }
}

#[async_trait]
impl CallRecordApi for HttpCallRecordApi {
    async fn initiate(
        &self,
        call_id: &CallId,
        callee: &UserId,
        media_kind: MediaKind,
    ) -> Result<CallId, ApiError> {
        let body = serde_json::to_value(InitiateRequest {
            call_id,
            callee_id: callee,
            media_kind,
        })
        .map_err(|e| ApiError::Decode(e.to_string()))?;
        let response: InitiateResponse = self.post("initiate", body).await?;
        Ok(response.call_id)
    }

    async fn accept(&self, call_id: &CallId) -> Result<(), ApiError> {
        let body = serde_json::to_value(CallIdRequest { call_id })
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        let _: serde_json::Value = self.post("accept", body).await?;
        Ok(())
    }

    async fn reject(&self, call_id: &CallId) -> Result<(), ApiError> {
        let body = serde_json::to_value(CallIdRequest { call_id })
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        let _: serde_json::Value = self.post("reject", body).await?;
        Ok(())
    }

    async fn end(&self, call_id: &CallId) -> Result<(), ApiError> {
        let body = serde_json::to_value(CallIdRequest { call_id })
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        let _: serde_json::Value = self.post("end", body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_building() {
        let api = HttpCallRecordApi::new("https://api.confab.example/", "token");
        assert_eq!(
            api.endpoint("initiate"),
            "https://api.confab.example/calls/initiate"
        );
        assert_eq!(api.endpoint("end"), "https://api.confab.example/calls/end");
    }

    #[test]
    fn test_initiate_request_wire_shape() {
        let call_id = CallId::new("AC90CFD09DF712D981142B172706F9F2");
        let callee = UserId::new("bob");
        let body = serde_json::to_value(InitiateRequest {
            call_id: &call_id,
            callee_id: &callee,
            media_kind: MediaKind::Audio,
        })
        .unwrap();

        assert_eq!(body["callId"], "AC90CFD09DF712D981142B172706F9F2");
        assert_eq!(body["calleeId"], "bob");
        assert_eq!(body["mediaKind"], "audio");
    }
}
