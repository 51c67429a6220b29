//! Membership admin client for the keva replica cluster itself.
//!
//! Membership changes are made against the replica cluster before the
//! corresponding pods are created or deleted, so a joining member is already
//! known to its peers and a leaving member stops being counted for quorum.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{OperatorError, Result};

/// One member as reported by the replica cluster's admin API.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaMember {
    pub name: String,
    #[serde(rename = "peerURL")]
    pub peer_url: String,
}

#[async_trait]
pub trait ReplicaAdmin: Send + Sync {
    /// Current membership as seen by the first reachable endpoint.
    async fn list_members(&self, client_endpoints: &[String]) -> Result<Vec<ReplicaMember>>;

    /// Register a new member before its pod starts.
    async fn add_member(&self, client_endpoints: &[String], peer_url: &str) -> Result<()>;

    /// Remove a member by name.
    async fn remove_member(&self, client_endpoints: &[String], name: &str) -> Result<()>;
}

/// HTTP implementation speaking the keva admin API on the client port.
pub struct HttpReplicaAdmin {
    http: reqwest::Client,
}

impl HttpReplicaAdmin {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpReplicaAdmin {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct MemberListResponse {
    members: Vec<ReplicaMember>,
}

#[async_trait]
impl ReplicaAdmin for HttpReplicaAdmin {
    async fn list_members(&self, client_endpoints: &[String]) -> Result<Vec<ReplicaMember>> {
        let mut last_err = None;
        for endpoint in client_endpoints {
            let url = format!("{}/v1/members", endpoint);
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let list: MemberListResponse = resp.json().await?;
                    return Ok(list.members);
                }
                Ok(resp) => {
                    last_err = Some(format!("{}: status {}", url, resp.status()));
                }
                Err(err) => {
                    debug!(endpoint = %endpoint, error = %err, "member list attempt failed");
                    last_err = Some(format!("{}: {}", url, err));
                }
            }
        }
        Err(OperatorError::ReplicaAdmin(
            last_err.unwrap_or_else(|| "no client endpoints available".to_string()),
        ))
    }

    async fn add_member(&self, client_endpoints: &[String], peer_url: &str) -> Result<()> {
        let body = serde_json::json!({ "peerURLs": [peer_url] });
        let mut last_err = None;
        for endpoint in client_endpoints {
            let url = format!("{}/v1/members", endpoint);
            match self.http.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    last_err = Some(format!("{}: status {}", url, resp.status()));
                }
                Err(err) => {
                    debug!(endpoint = %endpoint, error = %err, "member add attempt failed");
                    last_err = Some(format!("{}: {}", url, err));
                }
            }
        }
        Err(OperatorError::ReplicaAdmin(
            last_err.unwrap_or_else(|| "no client endpoints available".to_string()),
        ))
    }

    async fn remove_member(&self, client_endpoints: &[String], name: &str) -> Result<()> {
        let mut last_err = None;
        for endpoint in client_endpoints {
            let url = format!("{}/v1/members/{}", endpoint, name);
            match self.http.delete(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                // The member being gone already is the desired end state.
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => return Ok(()),
                Ok(resp) => {
                    last_err = Some(format!("{}: status {}", url, resp.status()));
                }
                Err(err) => {
                    debug!(endpoint = %endpoint, error = %err, "member remove attempt failed");
                    last_err = Some(format!("{}: {}", url, err));
                }
            }
        }
        Err(OperatorError::ReplicaAdmin(
            last_err.unwrap_or_else(|| "no client endpoints available".to_string()),
        ))
    }
}
