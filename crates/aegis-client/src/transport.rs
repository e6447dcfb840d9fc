//! The injectable HTTP transport.
//!
//! The client library talks to the issuer through this capability trait so
//! it can be embedded in environments that reach the issuer in-process or
//! through a bespoke stack; [`ReqwestTransport`] is the default over the
//! network.

use async_trait::async_trait;

use crate::error::ClientError;

/// A minimal HTTP response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,

    /// Response body bytes.
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Returns `true` for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserializes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an issuer error if the body is not the expected JSON shape.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ClientError::issuer(format!("unexpected response body: {e}")))
    }
}

/// An HTTP capability: `GET` and form-`POST` are all the client needs.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs a GET request.
    async fn get(&self, url: &str) -> Result<TransportResponse, ClientError>;

    /// Performs an `application/x-www-form-urlencoded` POST request.
    async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<TransportResponse, ClientError>;
}

/// The default transport over a [`reqwest::Client`].
#[derive(Default, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    /// Wraps a reqwest client.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse, ClientError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::transport(e.to_string()))?
            .to_vec();
        Ok(TransportResponse { status, body })
    }

    async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<TransportResponse, ClientError> {
        let response = self
            .http
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| ClientError::transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::transport(e.to_string()))?
            .to_vec();
        Ok(TransportResponse { status, body })
    }
}
