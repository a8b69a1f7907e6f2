//! Simulated agents for running workflows without real workers.
//!
//! Every agent name is accepted. Known agents of the built-in catalogue
//! answer with plausible canned results; anything else echoes its request.

use std::time::Duration;

use agentflow_core::agents::AgentInvoker;
use agentflow_core::error::AgentError;
use agentflow_core::workflow::DataMap;
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct SimulatedAgents {
    latency: Duration,
    failing: Vec<String>,
}

impl SimulatedAgents {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            failing: Vec::new(),
        }
    }

    /// Make every action of `agent_name` fail.
    pub fn failing(mut self, agent_name: impl Into<String>) -> Self {
        self.failing.push(agent_name.into());
        self
    }
}

#[async_trait]
impl AgentInvoker for SimulatedAgents {
    async fn invoke(&self, agent_name: &str, action: &str, params: DataMap) -> Result<Value, AgentError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.iter().any(|name| name == agent_name) {
            return Err(AgentError::ActionFailed(format!(
                "{} is configured to fail '{}'",
                agent_name, action
            )));
        }
        tracing::debug!("[Simulated] {}.{}", agent_name, action);
        Ok(respond(agent_name, action, &params))
    }
}

fn respond(agent_name: &str, action: &str, params: &DataMap) -> Value {
    let topic = params
        .get("topic")
        .or_else(|| params.get("category"))
        .and_then(Value::as_str)
        .unwrap_or("general");

    match (agent_name, action) {
        ("content-analyzer", _) => json!({
            "audience": "general",
            "tone": "informative",
            "requirementsAnalyzed": true,
        }),
        ("content-generator", "revise") => json!({ "revised": true, "qualityScore": 0.75 }),
        ("content-generator", "generate_trending") => json!({
            "draft": format!("What is trending in {}", topic),
            "trendingTopic": topic,
        }),
        ("content-generator", _) => json!({
            "draft": format!("Draft about {}", topic),
            "wordCount": 850,
        }),
        ("quality-checker", _) => json!({ "qualityScore": 0.8 }),
        ("seo-optimizer", "analyze_seo") => json!({ "seoScore": 0.6 }),
        ("seo-optimizer", _) => json!({ "seoScore": 0.75, "keywords": [topic, "guide"] }),
        ("content-validator", _) => json!({ "isValid": true }),
        ("content-formatter", _) => json!({
            "formattedFor": params.get("platforms").cloned().unwrap_or_else(|| json!([])),
        }),
        ("publisher", _) => json!({
            "published": true,
            "publishedAt": chrono::Utc::now().to_rfc3339(),
        }),
        ("notification-agent", _) => json!({ "notified": true }),
        ("behavior-tracker", _) => json!({ "interactions": 42 }),
        ("preference-analyzer", _) => json!({ "preferences": ["rust", "async"] }),
        ("behavior-analyzer", _) => json!({ "patterns": ["evening-reader"] }),
        ("recommendation-engine", _) => json!({
            "recommendations": ["Async Rust in practice", "Error handling with thiserror"],
        }),
        ("trend-analyzer", _) => json!({ "hasTrends": true, "trends": [topic] }),
        ("analytics-agent", _) => json!({ "views": 1200, "engagementRate": 0.03 }),
        ("readability-analyzer", _) => json!({ "readabilityScore": 0.7 }),
        ("content-optimizer", _) => json!({ "optimized": true }),
        _ => json!({ "agent": agent_name, "action": action, "handled": true }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_canned_and_echo_responses() {
        let agents = SimulatedAgents::new(Duration::ZERO);
        let mut params = DataMap::new();
        params.insert("category".to_string(), json!("tech"));

        let trends = agents.invoke("trend-analyzer", "detect_trends", params).await.unwrap();
        assert_eq!(trends["hasTrends"], json!(true));
        assert_eq!(trends["trends"], json!(["tech"]));

        let echo = agents.invoke("mailer", "send", DataMap::new()).await.unwrap();
        assert_eq!(echo["handled"], json!(true));
    }

    #[tokio::test]
    async fn test_failing_agent() {
        let agents = SimulatedAgents::new(Duration::ZERO).failing("publisher");
        let err = agents.invoke("publisher", "publish", DataMap::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::ActionFailed(_)));
    }
}
