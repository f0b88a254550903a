//! Firecracker HTTP API client.
//!
//! VMs are fully configured via `--config-file` at spawn time (see
//! `super::config`); the only API calls left are the `SendCtrlAltDel`
//! graceful-shutdown action and a diagnostic GET used for liveness probes
//! during development. No machine-config/boot-source/drive/network PUTs —
//! that surface only exists for pre-boot configuration, which this runtime
//! doesn't do over the socket.
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/api_server/swagger/firecracker.yaml

use std::path::Path;
use std::time::Duration;

use hyper::{body::Buf, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Per-request dial/response timeout (`spec.md` §6: "Dial timeout 3 s per
/// request.").
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors from the Firecracker API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request build error: {0}")]
    Request(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl From<hyper::http::Error> for ApiError {
    fn from(err: hyper::http::Error) -> Self {
        ApiError::Request(err.to_string())
    }
}

/// Firecracker API client for Unix socket communication.
pub struct FirecrackerClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl FirecrackerClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().to_string(),
            client: Client::unix(),
        }
    }

    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    /// Send `SendCtrlAltDel`, the guest's graceful-shutdown signal
    /// (`spec.md` §4.P "Stop protocol").
    pub async fn send_ctrl_alt_del(&self) -> Result<(), ApiError> {
        #[derive(Serialize)]
        struct Action {
            action_type: &'static str,
        }
        self.put("/actions", &Action { action_type: "SendCtrlAltDel" }).await
    }

    /// Diagnostic GET of Firecracker's root resource.
    pub async fn get(&self) -> Result<serde_json::Value, ApiError> {
        let uri = Uri::new(&self.socket_path, "/");

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Body::empty())?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| ApiError::Timeout(REQUEST_TIMEOUT))??;
        let status = response.status();
        let body = hyper::body::aggregate(response.into_body()).await?;

        if status.is_success() {
            Ok(serde_json::from_reader(body.reader())?)
        } else {
            let message = String::from_utf8_lossy(body.chunk()).to_string();
            Err(ApiError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        let body_bytes = serde_json::to_vec(body)?;
        let uri = Uri::new(&self.socket_path, path);

        debug!(path = path, "PUT request to Firecracker API");

        let request = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Body::from(body_bytes))?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| ApiError::Timeout(REQUEST_TIMEOUT))??;
        let status = response.status();

        // `spec.md` §6: "2xx/3xx = success; responses >= 300 are errors
        // carrying a text body." Read that literally: only >= 300 is an
        // error, so 2xx and 3xx both succeed.
        if status.as_u16() < 300 {
            Ok(())
        } else {
            let body = hyper::body::aggregate(response.into_body()).await?;
            let message = String::from_utf8_lossy(body.chunk()).to_string();
            Err(ApiError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_exists_reflects_filesystem() {
        let tmp = tempfile::tempdir().unwrap();
        let socket_path = tmp.path().join("firecracker.socket");
        let client = FirecrackerClient::new(&socket_path);
        assert!(!client.socket_exists());

        std::fs::write(&socket_path, []).unwrap();
        assert!(client.socket_exists());
    }
}
