//! HTTP transport over helper connections
//!
//! Every request dials a fresh helper, speaks HTTP/1.1 over its stdio and
//! closes the helper once the response body has been read. Nothing is
//! retried; [`TransportError::is_retriable`] tells the caller whether a new
//! attempt makes sense.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use helperconn::{ConnConfig, ConnError, ConnIo, HelperDialer, HelperRegistry};
use http::header::HOST;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::{HttpRequest, HttpResponse, Transport};

/// Host header Engine-API style daemons expect over non-TCP transports
pub const DEFAULT_HOST: &str = "docker";

/// HTTP transport that reaches the daemon through a helper process
#[derive(Debug)]
pub struct HelperHttpTransport {
    dialer: Arc<HelperDialer>,
    helper_url: String,
    target_address: String,
    host: String,
    timeout: Option<Duration>,
    closed: AtomicBool,
}

impl HelperHttpTransport {
    /// Create a transport that dials `helper_url` through `dialer`
    pub fn new(dialer: Arc<HelperDialer>, helper_url: impl Into<String>) -> Self {
        Self {
            dialer,
            helper_url: helper_url.into(),
            target_address: String::new(),
            host: DEFAULT_HOST.to_string(),
            timeout: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Transport using the built-in helpers and environment configuration
    pub fn from_url(helper_url: impl Into<String>) -> Self {
        let dialer = HelperDialer::new(HelperRegistry::with_defaults(), ConnConfig::from_env());
        Self::new(Arc::new(dialer), helper_url)
    }

    /// Target address substituted into `{address}` template placeholders
    pub fn with_target_address(mut self, address: impl Into<String>) -> Self {
        self.target_address = address.into();
        self
    }

    /// Override the `Host` header sent with each request
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Bound each request, dial included
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The helper URL requests are dialed through
    pub fn helper_url(&self) -> &str {
        &self.helper_url
    }

    fn build_request(&self, request: &HttpRequest) -> Result<Request<Full<Bytes>>> {
        let method = http::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| {
                TransportError::InvalidRequest(format!(
                    "unsupported HTTP method: {}",
                    request.method
                ))
            })?;

        let mut builder = Request::builder().method(method).uri(request.path.as_str());
        if !request.headers.keys().any(|k| k.eq_ignore_ascii_case(HOST.as_str())) {
            builder = builder.header(HOST, self.host.as_str());
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let body = request.body.clone().map(Bytes::from).unwrap_or_default();
        Ok(builder.body(Full::new(body))?)
    }

    async fn exchange(io: ConnIo, request: Request<Full<Bytes>>) -> Result<HttpResponse> {
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(from_hyper)?;
        let _driver = AbortOnDrop(tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(error = %err, "helper HTTP connection ended with error");
            }
        }));

        Self::read_response(&mut sender, request).await
    }

    async fn read_response(
        sender: &mut hyper::client::conn::http1::SendRequest<Full<Bytes>>,
        request: Request<Full<Bytes>>,
    ) -> Result<HttpResponse> {
        let response = sender.send_request(request).await.map_err(from_hyper)?;
        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(from_hyper)?
            .to_bytes()
            .to_vec();
        Ok(HttpResponse::new(status, headers, body))
    }

    async fn attempt(
        &self,
        request: &HttpRequest,
        http_request: Request<Full<Bytes>>,
    ) -> Result<HttpResponse> {
        let conn = self
            .dialer
            .dial(&self.helper_url, &self.target_address)
            .await?;
        let io = conn.into_io();
        let conn = io.conn().clone();
        debug!(
            method = %request.method,
            path = %request.path,
            pid = conn.pid(),
            "sending request through helper"
        );

        let result = Self::exchange(io, http_request).await;
        if let Err(err) = conn.close().await {
            debug!(error = %err, "failed to close helper connection");
        }
        result
    }
}

#[async_trait]
impl Transport for HelperHttpTransport {
    async fn send_http(&self, request: HttpRequest) -> Result<HttpResponse> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let http_request = self.build_request(&request)?;

        let attempt = self.attempt(&request, http_request);

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .unwrap_or(Err(TransportError::Timeout)),
            None => attempt.await,
        }
    }

    async fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Stops the connection driver when the exchange finishes or is cancelled,
/// releasing its handle on the helper
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Recover the connection error hyper wrapped, keeping the helper's exit
/// status and stderr
fn from_hyper(err: hyper::Error) -> TransportError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(cause) = source {
        if let Some(conn_err) = cause
            .downcast_ref::<io::Error>()
            .and_then(|io_err| io_err.get_ref())
            .and_then(|inner| inner.downcast_ref::<ConnError>())
        {
            return TransportError::Connection(conn_err.clone());
        }
        source = cause.source();
    }
    TransportError::from(err)
}
