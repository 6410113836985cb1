//! Minimal JSON-over-HTTP/1 client.
//!
//! One connection per request, bounded by a caller-supplied timeout. Only
//! plain `http://` endpoints are supported; the control loop talks to
//! in-cluster services (Prometheus, a compute API gateway).

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// Errors from a single HTTP exchange.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid uri {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("connect to {0} failed: {1}")]
    Connect(String, String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("http {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// GET `uri` and decode the JSON response.
pub async fn get_json<T: DeserializeOwned>(uri: &str, timeout: Duration) -> Result<T, HttpError> {
    let body = send(Method::GET, uri, None, timeout).await?;
    serde_json::from_slice(&body).map_err(|e| HttpError::Decode(e.to_string()))
}

/// Send `body` as JSON and decode the JSON response.
pub async fn send_json<B, T>(
    method: Method,
    uri: &str,
    body: &B,
    timeout: Duration,
) -> Result<T, HttpError>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    let payload = serde_json::to_vec(body).map_err(|e| HttpError::Request(e.to_string()))?;
    let body = send(method, uri, Some(payload), timeout).await?;
    serde_json::from_slice(&body).map_err(|e| HttpError::Decode(e.to_string()))
}

/// Send a request whose response body is ignored (e.g. DELETE).
pub async fn send_empty(method: Method, uri: &str, timeout: Duration) -> Result<(), HttpError> {
    send(method, uri, None, timeout).await.map(|_| ())
}

async fn send(
    method: Method,
    uri: &str,
    payload: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<Bytes, HttpError> {
    let parsed: Uri = uri.parse().map_err(|e: http::uri::InvalidUri| HttpError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.scheme_str() != Some("http") {
        return Err(HttpError::InvalidUri {
            uri: uri.to_string(),
            reason: "only http:// is supported".to_string(),
        });
    }
    let authority = parsed
        .authority()
        .ok_or_else(|| HttpError::InvalidUri {
            uri: uri.to_string(),
            reason: "missing host".to_string(),
        })?
        .clone();
    let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));

    let exchange = async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| HttpError::Connect(address.clone(), e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| HttpError::Connect(address.clone(), e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(parsed.path_and_query().map(|p| p.as_str()).unwrap_or("/"))
            .header("host", authority.as_str())
            .header("user-agent", "nodefleet/0.1")
            .header("accept", "application/json");
        if payload.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(payload.unwrap_or_default())))
            .map_err(|e| HttpError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| HttpError::Request(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| HttpError::Request(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            debug!(%status, %method, uri = %parsed, "non-2xx response");
            return Err(HttpError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(HttpError::Timeout(timeout)),
    }
}
