//! HTTP tracker clients speaking the JSON announce and metainfo API.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{AnnounceClient, AnnounceResponse, MetainfoClient, PeerContext, TrackerError};
use crate::config::AnnounceConfig;
use crate::storage::PieceLayout;
use crate::swarm::ContentDigest;

/// Query parameters sent with an announce.
#[derive(Debug, Serialize)]
struct AnnounceQuery {
    digest: String,
    peer_id: String,
    ip: String,
    port: u16,
    complete: bool,
}

/// Wire form of one discovered peer.
#[derive(Debug, Deserialize)]
struct WirePeer {
    ip: String,
    port: u16,
}

/// Wire form of an announce response.
#[derive(Debug, Deserialize)]
struct WireAnnounceResponse {
    #[serde(default)]
    peers: Vec<WirePeer>,
    #[serde(default)]
    interval_secs: Option<u64>,
}

fn build_client(config: &AnnounceConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(config.timeout)
        .user_agent(config.user_agent)
        .build()
        .expect("HTTP client creation should not fail")
}

fn parse_base(url: &str) -> Result<Url, TrackerError> {
    Url::parse(url).map_err(|_| TrackerError::InvalidUrl {
        url: url.to_string(),
    })
}

fn map_send_error(url: &str, error: reqwest::Error) -> TrackerError {
    if error.is_timeout() {
        TrackerError::Timeout {
            url: url.to_string(),
        }
    } else {
        TrackerError::ConnectionFailed {
            url: url.to_string(),
        }
    }
}

fn map_status(url: &str, digest: ContentDigest, status: reqwest::StatusCode) -> TrackerError {
    match status.as_u16() {
        404 => TrackerError::NotFound { digest },
        code => TrackerError::ServerError {
            url: url.to_string(),
            status: code,
        },
    }
}

/// Announce client speaking JSON over HTTP.
pub struct HttpAnnounceClient {
    announce_url: Url,
    client: reqwest::Client,
}

impl HttpAnnounceClient {
    /// Creates an announce client for `<base>/announce`.
    ///
    /// # Errors
    /// - `TrackerError::InvalidUrl` - Base URL does not parse
    pub fn new(base_url: &str, config: &AnnounceConfig) -> Result<Self, TrackerError> {
        let base = parse_base(base_url)?;
        let announce_url = base
            .join("announce")
            .map_err(|_| TrackerError::InvalidUrl {
                url: base_url.to_string(),
            })?;
        Ok(Self {
            announce_url,
            client: build_client(config),
        })
    }
}

#[async_trait]
impl AnnounceClient for HttpAnnounceClient {
    async fn announce(
        &self,
        digest: ContentDigest,
        local: &PeerContext,
        complete: bool,
    ) -> Result<AnnounceResponse, TrackerError> {
        let url = self.announce_url.as_str();
        tracing::debug!("announcing {} to {}", digest, url);

        let query = AnnounceQuery {
            digest: digest.to_string(),
            peer_id: local.peer_id.to_string(),
            ip: local.addr.ip().to_string(),
            port: local.addr.port(),
            complete,
        };

        let response = self
            .client
            .get(self.announce_url.clone())
            .query(&query)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("announce request to {} failed: {}", url, e);
                map_send_error(url, e)
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!("tracker {} returned error status {}", url, status);
            return Err(map_status(url, digest, status));
        }

        let wire: WireAnnounceResponse =
            response
                .json()
                .await
                .map_err(|e| TrackerError::InvalidResponse {
                    reason: format!("announce body did not parse: {e}"),
                })?;

        let peers = wire
            .peers
            .into_iter()
            .filter_map(|peer| {
                let ip = peer.ip.parse().ok()?;
                Some(SocketAddr::new(ip, peer.port))
            })
            .collect::<Vec<_>>();

        tracing::debug!("tracker {} returned {} peers for {}", url, peers.len(), digest);

        Ok(AnnounceResponse {
            peers,
            interval: wire.interval_secs.map(Duration::from_secs),
        })
    }
}

/// Metainfo client fetching piece layouts as JSON over HTTP.
pub struct HttpMetainfoClient {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpMetainfoClient {
    /// Creates a metainfo client for `<base>/metainfo/<digest>`.
    ///
    /// # Errors
    /// - `TrackerError::InvalidUrl` - Base URL does not parse
    pub fn new(base_url: &str, config: &AnnounceConfig) -> Result<Self, TrackerError> {
        Ok(Self {
            base_url: parse_base(base_url)?,
            client: build_client(config),
        })
    }
}

#[async_trait]
impl MetainfoClient for HttpMetainfoClient {
    async fn fetch(&self, digest: ContentDigest) -> Result<PieceLayout, TrackerError> {
        let url = self
            .base_url
            .join(&format!("metainfo/{digest}"))
            .map_err(|_| TrackerError::InvalidUrl {
                url: self.base_url.to_string(),
            })?;

        tracing::debug!("fetching metainfo for {} from {}", digest, url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| map_send_error(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(url.as_str(), digest, status));
        }

        response
            .json()
            .await
            .map_err(|e| TrackerError::InvalidResponse {
                reason: format!("metainfo body did not parse: {e}"),
            })
    }
}
