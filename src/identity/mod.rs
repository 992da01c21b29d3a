//! Node identity resolution from cloud instance metadata
//!
//! A node needs two facts about itself before anything else can run: the
//! private IP the API server and kubelet bind to, and the hostname the
//! kubelet will register under. Both come from the EC2-style instance
//! metadata service. IMDSv2 (session token) is tried first and IMDSv1 plain
//! GETs are the fallback.
//!
//! Metadata errors are fatal. Nothing downstream can be rendered without an
//! identity, so there is no retry beyond the HTTP client timeout.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::{Error, Result};

/// Metadata path of the instance's primary private IPv4 address
pub const LOCAL_IPV4_PATH: &str = "meta-data/local-ipv4";
/// Metadata path of the instance's private DNS hostname
pub const LOCAL_HOSTNAME_PATH: &str = "meta-data/local-hostname";

const TOKEN_PATH: &str = "api/token";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_SECS: &str = "300";

/// Default HTTP timeout for metadata requests
pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity of this node as the cluster will see it
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    /// Private IP the node's components bind to
    pub local_ip: IpAddr,
    /// Lowercased hostname the kubelet registers the node under
    pub hostname: String,
}

impl NodeIdentity {
    /// Build an identity, normalizing the hostname
    pub fn new(local_ip: IpAddr, hostname: &str) -> Self {
        Self {
            local_ip,
            hostname: normalize_dns_name(hostname),
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.hostname, self.local_ip)
    }
}

/// Normalize a DNS name the way the cluster will compare it
///
/// Lowercases, trims whitespace and strips a single trailing dot. Node
/// names and certificate SANs are compared case-sensitively by some
/// clients, so every name is normalized once at load time.
pub fn normalize_dns_name(name: &str) -> String {
    let trimmed = name.trim();
    trimmed
        .strip_suffix('.')
        .unwrap_or(trimmed)
        .to_ascii_lowercase()
}

/// Trait for reading instance metadata (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Fetch the metadata value at `path` (relative to the endpoint base)
    async fn get(&self, path: &str) -> Result<String>;
}

/// Instance metadata client over HTTP
pub struct HttpMetadataClient {
    base: String,
    client: reqwest::Client,
    session_token: OnceCell<Option<String>>,
}

impl HttpMetadataClient {
    /// Create a client for the metadata service at `endpoint`
    pub fn new(endpoint: &str) -> Result<Self> {
        Self::with_timeout(endpoint, DEFAULT_METADATA_TIMEOUT)
    }

    /// Create a client with a custom request timeout
    pub fn with_timeout(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::metadata(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base: endpoint.trim_end_matches('/').to_string(),
            client,
            session_token: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// Request an IMDSv2 session token; `None` means fall back to IMDSv1
    async fn request_token(&self) -> Option<String> {
        let response = self
            .client
            .put(self.url(TOKEN_PATH))
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECS)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(token) if !token.trim().is_empty() => Some(token.trim().to_string()),
                _ => None,
            },
            Ok(resp) => {
                debug!(status = %resp.status(), "IMDSv2 token refused, falling back to IMDSv1");
                None
            }
            Err(e) => {
                debug!(error = %e, "IMDSv2 token request failed, falling back to IMDSv1");
                None
            }
        }
    }
}

#[async_trait]
impl MetadataClient for HttpMetadataClient {
    async fn get(&self, path: &str) -> Result<String> {
        let token = self
            .session_token
            .get_or_init(|| self.request_token())
            .await;

        let url = self.url(path);
        let mut request = self.client.get(&url);
        if let Some(token) = token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::metadata(format!("GET {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::metadata(format!(
                "GET {} returned HTTP {}",
                url,
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| Error::metadata(format!("GET {}: unreadable body: {}", url, e)))
    }
}

/// Resolves this node's [`NodeIdentity`]
pub struct NodeIdentityResolver {
    client: Arc<dyn MetadataClient>,
}

impl NodeIdentityResolver {
    /// Create a resolver over the given metadata client
    pub fn new(client: Arc<dyn MetadataClient>) -> Self {
        Self { client }
    }

    /// Query local IP and hostname
    pub async fn resolve(&self) -> Result<NodeIdentity> {
        let raw_ip = self.client.get(LOCAL_IPV4_PATH).await?;
        let local_ip: IpAddr = raw_ip.trim().parse().map_err(|_| {
            Error::metadata(format!("'{}' is not a valid IP address", raw_ip.trim()))
        })?;

        let raw_hostname = self.client.get(LOCAL_HOSTNAME_PATH).await?;
        // Some providers return a space separated list; the first is primary
        let hostname = raw_hostname.split_whitespace().next().unwrap_or_default();
        if hostname.is_empty() {
            return Err(Error::metadata("empty local hostname"));
        }

        let identity = NodeIdentity::new(local_ip, hostname);
        info!(node = %identity.hostname, local_ip = %identity.local_ip, "Resolved node identity");
        Ok(identity)
    }
}
