// HTTP client for talking to peer driver nodes and the stats host

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::messages::BasicResponse;

/// Default control-plane port when a host entry carries none
pub const DEFAULT_PEER_PORT: u16 = 7500;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Peer error ({status}) from {url}: {message}")]
    Peer {
        url: String,
        status: u16,
        message: String,
    },
}

impl TransportError {
    /// HTTP status returned by the peer, when there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Http(e) => e.status().map(|s| s.as_u16()),
            TransportError::Peer { status, .. } => Some(*status),
        }
    }
}

/// Thin reqwest wrapper shared by everything that fans messages out to peers
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    default_port: u16,
}

impl PeerClient {
    pub fn new(timeout: Duration, default_port: u16) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, default_port })
    }

    /// Build an absolute URL for a host entry ("name" or "name:port") and path
    pub fn url(&self, host: &str, path: &str) -> String {
        peer_url(host, self.default_port, path)
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    /// POST a JSON body and expect a 2xx `{status, message}` envelope back
    pub async fn post<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<BasicResponse, TransportError> {
        let response = self.http.post(url).json(body).send().await?;
        Self::handle_response(url, response).await
    }

    /// POST with an empty body
    pub async fn post_empty(&self, url: &str) -> Result<BasicResponse, TransportError> {
        let response = self.http.post(url).send().await?;
        Self::handle_response(url, response).await
    }

    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, TransportError> {
        let response = self.http.get(url).send().await?;
        Self::handle_response(url, response).await
    }

    async fn handle_response<T: DeserializeOwned>(
        url: &str,
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Peer {
                url: url.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json().await?;
        Ok(body)
    }
}

/// Join a host entry and a path, adding the default port when the host has none
pub fn peer_url(host: &str, default_port: u16, path: &str) -> String {
    let host = host
        .trim_start_matches("http://")
        .trim_end_matches('/');
    if host.contains(':') {
        format!("http://{}{}", host, path)
    } else {
        format!("http://{}:{}{}", host, default_port, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_peer_url() {
        assert_eq!(
            peer_url("driver1", 7500, "/driver/exit/r1"),
            "http://driver1:7500/driver/exit/r1"
        );
        assert_eq!(
            peer_url("driver1:9000", 7500, "/stats/run/r1"),
            "http://driver1:9000/stats/run/r1"
        );
        assert_eq!(
            peer_url("http://10.0.0.2:8080/", 7500, "/x"),
            "http://10.0.0.2:8080/x"
        );
    }

    #[tokio::test]
    async fn test_post_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/driver/run/r1/workload/w1/users"))
            .and(body_json(serde_json::json!({"activeUsers": 10})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "Success", "message": ""})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = PeerClient::new(Duration::from_secs(5), DEFAULT_PEER_PORT).unwrap();
        let url = format!("{}/driver/run/r1/workload/w1/users", server.uri());
        let resp = client
            .post(&url, &crate::messages::ChangeUsersMessage { active_users: 10 })
            .await
            .unwrap();
        assert!(resp.is_success());
    }

    #[tokio::test]
    async fn test_post_conflict_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(409)
                    .set_body_json(serde_json::json!({"status": "Failure", "message": "too many"})),
            )
            .mount(&server)
            .await;

        let client = PeerClient::new(Duration::from_secs(5), DEFAULT_PEER_PORT).unwrap();
        let err = client
            .post_empty(&format!("{}/driver/run/r1/workload/w1/stop", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(409));
    }
}
