//! CDP Session - Represents a connection to a specific browser target
//!
//! Design: Lightweight wrapper around CDPClient with target-specific context.
//! All sessions share the same WebSocket - no per-session connection overhead.

use crate::client::{CDPClient, CDPError, Result};
use crate::protocol::{CDPEvent, SessionId, TargetId};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Entry of `Target.getTargets` / `Target.getTargetInfo`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: TargetId,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

impl TargetInfo {
    pub fn is_page(&self) -> bool {
        self.target_type == "page"
    }
}

/// Domains enabled on attach when the caller does not choose
pub const DEFAULT_DOMAINS: &[&str] = &["Page", "DOM", "Runtime"];

/// CDP Session bound to a specific target
#[derive(Clone)]
pub struct CDPSession {
    /// Shared CDP client
    client: Arc<CDPClient>,

    /// Target this session is attached to
    pub target_id: TargetId,

    /// Session ID assigned by Chrome
    pub session_id: SessionId,

    /// Cached target info
    pub title: String,
    pub url: String,
}

impl CDPSession {
    /// Attach to a target and create session
    pub async fn attach(
        client: Arc<CDPClient>,
        target_id: TargetId,
        domains: Option<Vec<&str>>,
    ) -> Result<Self> {
        let result = client
            .send_request(
                "Target.attachToTarget",
                Some(json!({
                    "targetId": target_id,
                    "flatten": true,
                })),
                None,
            )
            .await?;

        let session_id = session_id_of(&result)?;

        let domains = domains.unwrap_or_else(|| DEFAULT_DOMAINS.to_vec());

        // Enable all domains in parallel
        let enable_futures: Vec<_> = domains
            .into_iter()
            .map(|domain| {
                let client = client.clone();
                let session_id = session_id.clone();
                async move {
                    let method = format!("{}.enable", domain);
                    client.send_request(&method, None, Some(&session_id)).await
                }
            })
            .collect();

        // Wait for all enables (ignore individual failures)
        let results = futures_util::future::join_all(enable_futures).await;
        let failures = results.iter().filter(|r| r.is_err()).count();
        if failures > 0 {
            tracing::warn!("Some domain enables failed: {}/{}", failures, results.len());
        }

        let target_info = target_info(&client, &target_id).await?;

        Ok(Self {
            client,
            target_id,
            session_id,
            title: target_info.title,
            url: target_info.url,
        })
    }

    /// Send command within this session's context
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.client
            .send_request(method, params, Some(&self.session_id))
            .await
    }

    /// Ordered stream of this session's events for one domain
    pub fn events(&self, domain: &str) -> mpsc::UnboundedReceiver<CDPEvent> {
        self.client
            .subscribe_domain(domain, Some(self.session_id.clone()))
    }
}

fn session_id_of(attach_result: &Value) -> Result<SessionId> {
    attach_result
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(CDPError::MissingField("sessionId"))
}

async fn target_info(client: &CDPClient, target_id: &str) -> Result<TargetInfo> {
    let result = client
        .send_request(
            "Target.getTargetInfo",
            Some(json!({ "targetId": target_id })),
            None,
        )
        .await?;

    serde_json::from_value(result["targetInfo"].clone()).map_err(CDPError::Json)
}

/// List page targets known to the browser
pub async fn page_targets(client: &CDPClient) -> Result<Vec<TargetInfo>> {
    let result = client.send_request("Target.getTargets", None, None).await?;
    let targets: Vec<TargetInfo> = serde_json::from_value(result["targetInfos"].clone())?;
    Ok(targets
        .into_iter()
        .filter(TargetInfo::is_page)
        .collect())
}
