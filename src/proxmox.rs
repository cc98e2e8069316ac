//! Minimal Proxmox VE API client
//!
//! Covers the three read endpoints the collector needs: the node list, the
//! guests of one category on a node, and the `rrddata` series of one guest.
//! Every response is wrapped in `{"data": ...}`. Calls are not retried; the
//! collector simply tries again on its next cycle.

use std::fmt;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::{instrument, trace};

use crate::config::ProxmoxConfig;
use crate::{EntityId, Sample};

/// Guest category on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Qemu,
    Lxc,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Qemu, EntityKind::Lxc];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Qemu => "qemu",
            EntityKind::Lxc => "lxc",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by [`PveClient`]
#[derive(Debug)]
pub enum PveError {
    /// Client could not be constructed (bad token, TLS setup)
    Config(String),

    /// Request never produced a response (connect, timeout)
    Transport(reqwest::Error),

    /// Non-2xx response
    Status { url: String, status: u16 },

    /// Body was not the expected JSON
    Decode { url: String, source: serde_json::Error },
}

impl fmt::Display for PveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PveError::Config(msg) => write!(f, "Invalid client configuration: {msg}"),
            PveError::Transport(e) => write!(f, "Request failed: {e}"),
            PveError::Status { url, status } => write!(f, "{url} answered with HTTP {status}"),
            PveError::Decode { url, source } => {
                write!(f, "Malformed response from {url}: {source}")
            }
        }
    }
}

impl std::error::Error for PveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PveError::Transport(e) => Some(e),
            PveError::Decode { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for PveError {
    fn from(err: reqwest::Error) -> Self {
        PveError::Transport(err)
    }
}

pub type PveResult<T> = Result<T, PveError>;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// A cluster node as listed by `GET /nodes`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Node {
    pub node: String,

    #[serde(default)]
    pub status: Option<String>,
}

/// A guest (VM or container) as listed by `GET /nodes/{node}/{kind}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Guest {
    /// `qemu` reports a number, `lxc` a numeric string
    #[serde(deserialize_with = "deserialize_vmid")]
    pub vmid: EntityId,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub status: Option<String>,
}

fn deserialize_vmid<'de, D>(deserializer: D) -> Result<EntityId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(EntityId),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(id) => Ok(id),
        RawId::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("vmid {text:?} is not numeric"))),
    }
}

/// Build the `Authorization` header value for an API token
///
/// Accepts the bare `user@realm!tokenid=secret` form as well as a value that
/// already carries the `PVEAPIToken=` scheme.
pub fn authorization_value(token: &str) -> String {
    if token.starts_with("PVEAPIToken=") {
        token.to_string()
    } else {
        format!("PVEAPIToken={token}")
    }
}

/// HTTP client for the Proxmox VE API
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PveClient {
    client: reqwest::Client,
    base_url: String,
    timeframe: String,
}

impl PveClient {
    pub fn new(config: &ProxmoxConfig) -> PveResult<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&authorization_value(token))
                .map_err(|e| PveError::Config(format!("token is not a valid header: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| PveError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeframe: config.timeframe.clone(),
        })
    }

    /// Client with default settings against `base_url`, without a token
    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> PveResult<Self> {
        let config = ProxmoxConfig {
            base_url: base_url.into(),
            token: None,
            timeout_secs: timeout.as_secs().max(1),
            timeframe: "hour".to_string(),
            accept_invalid_certs: false,
        };
        Self::new(&config)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> PveResult<T> {
        let url = format!("{}{}", self.base_url, path);
        trace!("GET {url}");

        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PveError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        let envelope: Envelope<T> =
            serde_json::from_slice(&body).map_err(|source| PveError::Decode {
                url: url.clone(),
                source,
            })?;

        Ok(envelope.data)
    }

    #[instrument(skip(self))]
    pub async fn list_nodes(&self) -> PveResult<Vec<Node>> {
        self.get("/nodes").await
    }

    #[instrument(skip(self))]
    pub async fn list_entities(&self, node: &str, kind: EntityKind) -> PveResult<Vec<Guest>> {
        self.get(&format!("/nodes/{node}/{kind}")).await
    }

    /// The `rrddata` series of one guest for the configured timeframe
    #[instrument(skip(self))]
    pub async fn fetch_series(
        &self,
        node: &str,
        kind: EntityKind,
        vmid: EntityId,
    ) -> PveResult<Vec<Sample>> {
        self.get(&format!(
            "/nodes/{node}/{kind}/{vmid}/rrddata?timeframe={}",
            self.timeframe
        ))
        .await
    }
}
