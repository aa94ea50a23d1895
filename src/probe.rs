use crate::configuration::ProbeSettings;
use crate::telemetry::error_chain_fmt;
use reqwest::{Client, StatusCode};

/// Liveness check against a running server: a single GET whose trimmed
/// body must match the expected literal.
#[derive(Clone, Debug)]
pub struct PingProbe {
    url: String,
    expected_body: String,
    http_client: Client,
}

#[derive(thiserror::Error)]
pub enum ProbeError {
    #[error("Failed to build the HTTP client for the probe.")]
    ClientSetup(#[source] reqwest::Error),
    #[error("Failed to execute request to {url}.")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} responded with {status}.")]
    UnexpectedStatus { url: String, status: StatusCode },
    #[error("Expected the response body to be {expected:?}, but it was {actual:?}.")]
    BodyMismatch { expected: String, actual: String },
}

impl std::fmt::Debug for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ProbeError {
    /// The request itself failed: refused, unresolvable, timed out, or
    /// answered without usable content.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProbeError::Transport { .. } | ProbeError::UnexpectedStatus { .. }
        )
    }

    /// A response arrived but did not carry the expected body.
    pub fn is_assertion_failure(&self) -> bool {
        matches!(self, ProbeError::BodyMismatch { .. })
    }
}

impl PingProbe {
    pub fn new(settings: &ProbeSettings) -> Result<Self, ProbeError> {
        let http_client = Client::builder()
            .connect_timeout(settings.connect_timeout())
            .read_timeout(settings.socket_timeout())
            // Every probe gets a fresh connection which is closed afterwards
            .pool_max_idle_per_host(0)
            .no_proxy()
            .build()
            .map_err(ProbeError::ClientSetup)?;
        Ok(Self {
            url: settings.url.clone(),
            expected_body: settings.expected_body.clone(),
            http_client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    #[tracing::instrument(name = "Probing server", skip(self), fields(url = %self.url))]
    pub async fn check(&self) -> Result<(), ProbeError> {
        let response = self
            .http_client
            .get(&self.url)
            .send()
            .await
            .map_err(|source| self.transport_error(source))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::UnexpectedStatus {
                url: self.url.clone(),
                status,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|source| self.transport_error(source))?;
        let actual = body.trim();
        if actual != self.expected_body {
            return Err(ProbeError::BodyMismatch {
                expected: self.expected_body.clone(),
                actual: actual.to_string(),
            });
        }

        tracing::info!("Server responded with the expected body");
        Ok(())
    }

    fn transport_error(&self, source: reqwest::Error) -> ProbeError {
        ProbeError::Transport {
            url: self.url.clone(),
            source,
        }
    }
}
