//! Interactive browser sign-in
//!
//! The token manager hands an authorize URL to an [`InteractiveFlow`] and waits
//! for the URL the provider finally redirected to. The loopback implementation
//! opens the system browser and accepts that redirect on a one-shot localhost
//! listener.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("sign-in was cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
    #[error("{0}")]
    Unavailable(String),
}

/// Drives the user through the authorize URL.
#[async_trait]
pub trait InteractiveFlow: Send + Sync {
    /// Resolve with the final redirect URL, including its query string.
    async fn launch(&self, authorize_url: &str) -> Result<String, FlowError>;
}

/// Supplies the redirect URI registered with the identity provider.
pub trait RedirectProvider: Send + Sync {
    /// `None` when the host has no redirect mechanism available.
    fn redirect_url(&self) -> Option<String>;
}

/// Stand-in when no browser flow can be offered on this host.
#[derive(Debug, Clone)]
pub struct UnavailableFlow {
    reason: String,
}

impl UnavailableFlow {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl InteractiveFlow for UnavailableFlow {
    async fn launch(&self, _authorize_url: &str) -> Result<String, FlowError> {
        Err(FlowError::Unavailable(self.reason.clone()))
    }
}

impl RedirectProvider for UnavailableFlow {
    fn redirect_url(&self) -> Option<String> {
        None
    }
}

type BrowserOpener = Arc<dyn Fn(&str) -> std::io::Result<()> + Send + Sync>;

const SUCCESS_PAGE: &str = "<!DOCTYPE html><html><head><title>Signed in</title></head>\
<body><h3>Sign-in complete.</h3><p>You can close this window and return to the application.</p></body></html>";

/// System browser plus a loopback listener on the redirect URI's port.
#[derive(Clone)]
pub struct LoopbackBrowserFlow {
    redirect: Url,
    opener: BrowserOpener,
}

impl LoopbackBrowserFlow {
    /// Accepts `http://localhost:<port>/<path>` or `http://127.0.0.1:<port>/<path>`.
    pub fn new(redirect_uri: &str) -> Result<Self, FlowError> {
        let redirect = Url::parse(redirect_uri)
            .map_err(|e| FlowError::Unavailable(format!("invalid redirect URI {}: {}", redirect_uri, e)))?;

        let loopback = matches!(redirect.host_str(), Some("localhost") | Some("127.0.0.1"));
        if redirect.scheme() != "http" || !loopback || redirect.port().is_none() {
            return Err(FlowError::Unavailable(format!(
                "redirect URI {} is not an http://localhost:<port> loopback address",
                redirect_uri
            )));
        }

        Ok(Self {
            redirect,
            opener: Arc::new(|url: &str| webbrowser::open(url)),
        })
    }

    /// Replace how the authorize URL is opened.
    pub fn with_opener<F>(mut self, opener: F) -> Self
    where
        F: Fn(&str) -> std::io::Result<()> + Send + Sync + 'static,
    {
        self.opener = Arc::new(opener);
        self
    }

    async fn accept_redirect(&self, listener: &TcpListener) -> Result<String, FlowError> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| FlowError::Failed(format!("loopback listener failed: {}", e)))?;
            tracing::debug!("Loopback connection from {}", peer);

            match self.handle_connection(stream).await {
                Ok(Some(url)) => return Ok(url),
                Ok(None) => continue,
                Err(e) => tracing::debug!("Ignoring loopback request: {}", e),
            }
        }
    }

    /// Answer one browser request; `Some` once the redirect path is hit.
    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<Option<String>> {
        let mut request_line = String::new();
        {
            let mut reader = BufReader::new(&mut stream);
            reader.read_line(&mut request_line).await?;
            // Drain the headers so closing the socket does not reset the browser
            let mut header = String::new();
            while reader.read_line(&mut header).await? > 0 && !header.trim().is_empty() {
                header.clear();
            }
        }

        let target = match request_target(&request_line) {
            Some(target) if target_path(target) == self.redirect.path() => target.to_string(),
            _ => {
                stream
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await?;
                return Ok(None);
            }
        };

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            SUCCESS_PAGE.len(),
            SUCCESS_PAGE
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;

        Ok(Some(format!("{}{}", self.redirect.origin().ascii_serialization(), target)))
    }
}

#[async_trait]
impl InteractiveFlow for LoopbackBrowserFlow {
    async fn launch(&self, authorize_url: &str) -> Result<String, FlowError> {
        let host = self.redirect.host_str().unwrap_or("localhost");
        let port = self.redirect.port().unwrap_or_default();
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| FlowError::Unavailable(format!("cannot listen on {}:{}: {}", host, port, e)))?;

        if let Err(e) = (self.opener)(authorize_url) {
            tracing::warn!("Could not open a browser: {}", e);
            println!();
            println!("To sign in, open this URL in your browser:");
            println!("{}", authorize_url);
            println!();
        }

        tracing::info!("Waiting for sign-in to complete in the browser...");
        tokio::select! {
            result = self.accept_redirect(&listener) => result,
            _ = tokio::signal::ctrl_c() => Err(FlowError::Cancelled),
        }
    }
}

impl RedirectProvider for LoopbackBrowserFlow {
    fn redirect_url(&self) -> Option<String> {
        Some(self.redirect.to_string())
    }
}

/// `GET /callback?code=x HTTP/1.1` -> `/callback?code=x`
fn request_target(request_line: &str) -> Option<&str> {
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    (method == "GET" && target.starts_with('/')).then_some(target)
}

fn target_path(target: &str) -> &str {
    target.split(|c: char| c == '?' || c == '#').next().unwrap_or(target)
}
