//! REST lookup of a call's server-side record.

use callcore::net::{HttpClient, HttpRequest};
use callcore::types::{CallId, CallRecord, LocalIdentity};
use log::debug;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status request failed: {0}")]
    Request(#[from] anyhow::Error),
    #[error("status request returned HTTP {status}")]
    Http { status: u16 },
    #[error("malformed status response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Some deployments wrap responses in `{"data": ...}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    Wrapped { data: CallRecord },
    Bare(CallRecord),
}

impl Envelope {
    fn into_record(self) -> CallRecord {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(record) => record,
        }
    }
}

pub struct CallStatusClient {
    http: Arc<dyn HttpClient>,
    base_url: String,
    identity: LocalIdentity,
}

impl CallStatusClient {
    pub fn new(http: Arc<dyn HttpClient>, base_url: impl Into<String>, identity: LocalIdentity) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            identity,
        }
    }

    pub fn status_url(&self, call_id: &CallId) -> String {
        format!(
            "{}/call/{}/status",
            self.base_url,
            urlencoding::encode(call_id.as_str())
        )
    }

    pub async fn fetch_status(&self, call_id: &CallId) -> Result<CallRecord, StatusError> {
        let request = HttpRequest::get(self.status_url(call_id))
            .with_header("Authorization", self.identity.bearer())
            .with_header("Accept", "application/json");
        debug!("GET {}", request.url);

        let response = self.http.execute(request).await?;
        if !response.is_success() {
            return Err(StatusError::Http {
                status: response.status_code,
            });
        }
        let envelope: Envelope = serde_json::from_slice(&response.body)?;
        Ok(envelope.into_record())
    }
}
