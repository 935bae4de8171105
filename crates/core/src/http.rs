//! HTTP downloads for plugin updates
//!
//! [`HttpClient`] is the seam the updater and the upstream lookups depend on;
//! [`ReqwestClient`] is the real implementation.

use crate::errors::{PluginError, Result};
use std::time::Duration;
use tracing::{debug, instrument};

/// Sent with every request; the GitHub API rejects requests without one
pub const USER_AGENT: &str = concat!("mcprep/", env!("CARGO_PKG_VERSION"));

/// Fetch a URL's body
#[allow(async_fn_in_trait)]
pub trait HttpClient {
    async fn get(&self, url: &str) -> Result<Vec<u8>>;
}

impl<T: HttpClient + ?Sized> HttpClient for &T {
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        (**self).get(url).await
    }
}

/// Default HTTP client implementation using reqwest
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Create a client without a request timeout
    pub fn new() -> Result<Self> {
        Self::with_timeout(None)
    }

    /// Create a client whose requests give up after `timeout`
    pub fn with_timeout(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
            debug!("Configured HTTP client with timeout: {:?}", timeout);
        }
        let client = builder.build().map_err(|e| PluginError::Client {
            message: e.to_string(),
        })?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    #[instrument(level = "debug", skip(self))]
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let request_error = |e: reqwest::Error| {
            let message = if e.is_timeout() {
                "request timed out; check network connectivity".to_string()
            } else {
                e.to_string()
            };
            PluginError::Http {
                url: url.to_string(),
                message,
            }
        };

        let response = self.client.get(url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(PluginError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            }
            .into());
        }

        let bytes = response.bytes().await.map_err(request_error)?;
        debug!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory HTTP client keyed by exact URL

    use super::HttpClient;
    use crate::errors::{PluginError, Result};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Default)]
    pub struct MockHttpClient {
        responses: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        requested: Arc<Mutex<Vec<String>>>,
    }

    impl MockHttpClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, url: &str, body: impl Into<Vec<u8>>) {
            self.responses
                .lock()
                .unwrap()
                .insert(url.to_string(), body.into());
        }

        /// URLs requested so far, in order
        pub fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    impl HttpClient for MockHttpClient {
        async fn get(&self, url: &str) -> Result<Vec<u8>> {
            self.requested.lock().unwrap().push(url.to_string());
            self.responses
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| {
                    PluginError::Status {
                        url: url.to_string(),
                        status: 404,
                    }
                    .into()
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PrepError;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_get_returns_body_and_sends_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/plugins/EssentialsX-2.20.1.jar"))
            .and(header("user-agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK\x03\x04".to_vec()))
            .mount(&server)
            .await;

        let client = ReqwestClient::new().unwrap();
        let body = client
            .get(&format!("{}/plugins/EssentialsX-2.20.1.jar", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, b"PK\x03\x04");
    }

    #[tokio::test]
    async fn test_get_maps_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.jar"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = ReqwestClient::with_timeout(Some(Duration::from_secs(5))).unwrap();
        let err = client
            .get(&format!("{}/missing.jar", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PrepError::Plugin(PluginError::Status { status: 404, .. })
        ));
    }
}
