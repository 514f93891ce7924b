// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for the coordinator admin API

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use agentmesh_core::application::agent_manager::RegistrationRequest;
use agentmesh_core::application::discovery::DiscoveryQuery;
use agentmesh_core::application::message_router::PendingRoute;
use agentmesh_core::domain::agent::{AgentDescriptor, AgentId, Capability};
use agentmesh_core::domain::message::MessageId;
use agentmesh_core::presentation::api::{
    AgentSummary, MetricsResponse, RejectResponse, RoutingDecisionResponse, SendMessageRequest,
};

/// Error body returned by the coordinator.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct MeshClient {
    client: Client,
    base_url: String,
}

impl MeshClient {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url(host, port),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.fetch(self.client.get(self.url("/health")), "check health").await
    }

    pub async fn list_agents(&self, query: &DiscoveryQuery) -> Result<Vec<AgentSummary>> {
        self.fetch(self.client.get(self.url("/agents")).query(query), "list agents")
            .await
    }

    pub async fn get_agent(&self, agent_id: &AgentId) -> Result<AgentDescriptor> {
        self.fetch(self.client.get(self.url(&format!("/agents/{}", agent_id))), "get agent")
            .await
    }

    pub async fn register_agent(&self, request: &RegistrationRequest) -> Result<AgentDescriptor> {
        self.fetch(
            self.client.post(self.url("/agents/register")).json(request),
            "register agent",
        )
        .await
    }

    pub async fn remove_agent(&self, agent_id: &AgentId, drain: bool) -> Result<AgentSummary> {
        self.fetch(
            self.client
                .delete(self.url(&format!("/agents/{}", agent_id)))
                .query(&[("drain", drain)]),
            "remove agent",
        )
        .await
    }

    pub async fn drain_agent(&self, agent_id: &AgentId) -> Result<AgentSummary> {
        self.fetch(
            self.client.post(self.url(&format!("/agents/{}/drain", agent_id))),
            "drain agent",
        )
        .await
    }

    /// Returns whether the heartbeat was applied (false when it was stale).
    pub async fn heartbeat(&self, agent_id: &AgentId) -> Result<bool> {
        #[derive(Deserialize)]
        struct HeartbeatResponse {
            applied: bool,
        }

        let response: HeartbeatResponse = self
            .fetch(
                self.client.post(self.url(&format!("/agents/{}/heartbeat", agent_id))),
                "send heartbeat",
            )
            .await?;
        Ok(response.applied)
    }

    pub async fn capabilities(&self) -> Result<BTreeMap<Capability, usize>> {
        self.fetch(self.client.get(self.url("/capabilities")), "list capabilities")
            .await
    }

    pub async fn send_message(&self, request: &SendMessageRequest) -> Result<RoutingDecisionResponse> {
        self.fetch(
            self.client.post(self.url("/messages/send")).json(request),
            "send message",
        )
        .await
    }

    pub async fn message_status(&self, message_id: MessageId) -> Result<PendingRoute> {
        self.fetch(
            self.client.get(self.url(&format!("/messages/{}", message_id))),
            "get message status",
        )
        .await
    }

    pub async fn acknowledge(&self, message_id: MessageId, agent_id: &AgentId) -> Result<()> {
        #[derive(Serialize)]
        struct AckRequest<'a> {
            agent_id: &'a AgentId,
        }

        let _: serde_json::Value = self
            .fetch(
                self.client
                    .post(self.url(&format!("/messages/{}/ack", message_id)))
                    .json(&AckRequest { agent_id }),
                "acknowledge message",
            )
            .await?;
        Ok(())
    }

    pub async fn reject(
        &self,
        message_id: MessageId,
        agent_id: &AgentId,
        reason: &str,
        retry: bool,
    ) -> Result<RejectResponse> {
        #[derive(Serialize)]
        struct RejectRequest<'a> {
            agent_id: &'a AgentId,
            reason: &'a str,
            retry: bool,
        }

        self.fetch(
            self.client
                .post(self.url(&format!("/messages/{}/reject", message_id)))
                .json(&RejectRequest {
                    agent_id,
                    reason,
                    retry,
                }),
            "reject message",
        )
        .await
    }

    pub async fn metrics(&self) -> Result<MetricsResponse> {
        self.fetch(self.client.get(self.url("/metrics")), "get metrics").await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder, action: &str) -> Result<T> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to {} (is the coordinator running at {}?)", action, self.base_url))?;
        let response = check_status(response, action).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response to {}", action))
    }
}

async fn check_status(response: Response, action: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => anyhow::bail!("Failed to {}: {} ({}, HTTP {})", action, body.message, body.error, status),
        Err(_) => anyhow::bail!("Failed to {}: HTTP {} {}", action, status, text),
    }
}

/// Accept either a bare host or a URL with a scheme.
pub fn base_url(host: &str, port: u16) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}:{}", host, port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_adds_scheme_when_missing() {
        assert_eq!(base_url("127.0.0.1", 8700), "http://127.0.0.1:8700");
        assert_eq!(base_url("https://mesh.internal/", 443), "https://mesh.internal:443");
    }
}
