//! An HTTP client whose in-flight work can be torn down en masse.
//!
//! Every request future and response-body read issued through a
//! [`ScopedClient`] races against the client's scope token. Cancelling
//! the token aborts them all, dropping the underlying connections — the
//! buyer must abandon open streams the moment the transaction leaves its
//! legal phase window.

use std::io::Write;

use tokio_util::sync::CancellationToken;

use crate::{Result, TradeError};

/// Upper bound on the bytes read from an error-response excerpt.
const ERROR_EXCERPT_LIMIT: usize = 1024;

/// An HTTP client bound to a cancellation scope. Clones share both the
/// connection pool and the scope.
#[derive(Clone)]
pub struct ScopedClient {
    http: reqwest::Client,
    scope: CancellationToken,
}

impl ScopedClient {
    /// Build a client with a fresh scope.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| TradeError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            scope: CancellationToken::new(),
        })
    }

    /// The scope token, for registration with a watchdog.
    pub fn scope_token(&self) -> CancellationToken {
        self.scope.clone()
    }

    /// Abort every in-flight request and body read.
    pub fn close(&self) {
        self.scope.cancel();
    }

    /// Whether the scope has been closed.
    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Start building a request.
    pub fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http.request(method, url)
    }

    /// Send a request, racing the scope.
    pub async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        tokio::select! {
            _ = self.scope.cancelled() => Err(TradeError::Transport(
                "connection scope closed".to_string(),
            )),
            response = request.send() => {
                response.map_err(|e| TradeError::Transport(e.to_string()))
            }
        }
    }

    /// Read a whole response body, racing the scope.
    pub async fn read_body(&self, mut response: reqwest::Response) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        while let Some(chunk) = self.next_chunk(&mut response).await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// Stream a response body into a writer, racing the scope.
    pub async fn copy_body<W: Write>(
        &self,
        mut response: reqwest::Response,
        sink: &mut W,
    ) -> Result<u64> {
        let mut total = 0u64;
        while let Some(chunk) = self.next_chunk(&mut response).await? {
            sink.write_all(&chunk)
                .map_err(|e| TradeError::Transport(e.to_string()))?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    /// Read at most 1 KiB of an error response for diagnostics.
    pub async fn read_error_excerpt(&self, mut response: reqwest::Response) -> String {
        let mut excerpt = Vec::new();
        while excerpt.len() < ERROR_EXCERPT_LIMIT {
            match self.next_chunk(&mut response).await {
                Ok(Some(chunk)) => excerpt.extend_from_slice(&chunk),
                _ => break,
            }
        }
        excerpt.truncate(ERROR_EXCERPT_LIMIT);
        String::from_utf8_lossy(&excerpt).into_owned()
    }

    async fn next_chunk(&self, response: &mut reqwest::Response) -> Result<Option<bytes::Bytes>> {
        tokio::select! {
            _ = self.scope.cancelled() => Err(TradeError::Transport(
                "connection scope closed".to_string(),
            )),
            chunk = response.chunk() => {
                chunk.map_err(|e| TradeError::Transport(e.to_string()))
            }
        }
    }
}
