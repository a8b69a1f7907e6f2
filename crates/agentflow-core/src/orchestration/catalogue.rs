//! Built-in workflow definitions registered by `WorkflowSystem::init`.
//!
//! The step lists are application policy: each definition only names agents
//! and actions, the registry behind the system decides what they do.

use serde_json::json;

use crate::workflow::condition::Condition;
use crate::workflow::schema::{RetryPolicy, WorkflowDefinition, WorkflowStep};
use crate::workflow::transform::TransformOp;

pub const CONTENT_CREATION: &str = "content-creation";
pub const USER_BEHAVIOR_ANALYSIS: &str = "user-behavior-analysis";
pub const CONTENT_PUBLISHING: &str = "content-publishing";
pub const TRENDING_CONTENT: &str = "trending-content";
pub const CONTENT_OPTIMIZATION: &str = "content-optimization";

// ─── Definitions ──────────────────────────────────────────────────────────

/// Analyze the brief, draft, score, revise if needed, then optimize for search.
pub fn content_creation() -> WorkflowDefinition {
    WorkflowDefinition::new(CONTENT_CREATION, "Content Creation")
        .with_description("Creates a piece of content from a brief with quality gating")
        .with_condition("meetsQualityBar", Condition::expr("qualityScore >= 0.7"))
        .with_step(
            WorkflowStep::agent("analyze-requirements", "content-analyzer", "analyze_requirements")
                .with_params(json!({ "depth": "standard" })),
        )
        .with_step(
            WorkflowStep::agent("generate-content", "content-generator", "generate")
                .with_params(json!({ "brief": "${topic}" }))
                .with_timeout(60_000),
        )
        .with_step(WorkflowStep::agent("quality-check", "quality-checker", "check_quality"))
        .with_step(WorkflowStep::condition(
            "quality-gate",
            Condition::Ref("meetsQualityBar".to_string()),
            Some("seo-optimize"),
            None,
        ))
        .with_step(WorkflowStep::agent("revise-content", "content-generator", "revise"))
        .with_step(
            WorkflowStep::agent("seo-optimize", "seo-optimizer", "optimize")
                .continue_on_error(),
        )
}

/// Collect interactions and preferences side by side, then derive recommendations.
pub fn user_behavior_analysis() -> WorkflowDefinition {
    WorkflowDefinition::new(USER_BEHAVIOR_ANALYSIS, "User Behavior Analysis")
        .with_description("Analyzes a user's behavior and produces recommendations")
        .with_step(WorkflowStep::parallel(
            "collect-signals",
            vec![
                WorkflowStep::agent("collect-interactions", "behavior-tracker", "collect_interactions"),
                WorkflowStep::agent("collect-preferences", "preference-analyzer", "analyze_preferences"),
            ],
        ))
        .with_step(WorkflowStep::agent("analyze-patterns", "behavior-analyzer", "analyze_patterns"))
        .with_step(
            WorkflowStep::agent("generate-recommendations", "recommendation-engine", "generate_recommendations")
                .with_params(json!({ "limit": 10 })),
        )
}

/// Validate, then format and publish only content that passed validation.
pub fn content_publishing() -> WorkflowDefinition {
    WorkflowDefinition::new(CONTENT_PUBLISHING, "Content Publishing")
        .with_description("Validates content and publishes it to the requested platforms")
        .with_retry_policy(RetryPolicy::new(2, 2_000))
        .with_condition("isValid", Condition::expr("isValid == true"))
        .with_step(WorkflowStep::agent("validate-content", "content-validator", "validate"))
        .with_step(
            WorkflowStep::agent("format-content", "content-formatter", "format_for_platforms")
                .when(Condition::Ref("isValid".to_string())),
        )
        .with_step(
            WorkflowStep::agent("publish-content", "publisher", "publish")
                .with_timeout(120_000)
                .when(Condition::Ref("isValid".to_string())),
        )
        .with_step(
            WorkflowStep::agent("notify-subscribers", "notification-agent", "notify")
                .when(Condition::Ref("isValid".to_string()))
                .with_retry(RetryPolicy::none())
                .continue_on_error(),
        )
}

/// Detect trends for a category and, when there are any, draft content for them.
pub fn trending_content() -> WorkflowDefinition {
    WorkflowDefinition::new(TRENDING_CONTENT, "Trending Content")
        .with_description("Finds trending topics in a category and drafts content")
        .with_step(
            WorkflowStep::agent("detect-trends", "trend-analyzer", "detect_trends")
                .with_params(json!({ "window": "24h" })),
        )
        .with_step(WorkflowStep::condition(
            "has-trends",
            Condition::expr("hasTrends == true"),
            None,
            Some("summarize"),
        ))
        .with_step(
            WorkflowStep::agent("generate-trending", "content-generator", "generate_trending")
                .with_params(json!({ "topic": "${category}" })),
        )
        .with_step(WorkflowStep::transform(
            "summarize",
            vec![
                TransformOp::Set {
                    key: "workflowType".to_string(),
                    value: json!("trending"),
                },
                TransformOp::Format {
                    key: "summary".to_string(),
                    template: "Trending content run for ${category}".to_string(),
                },
            ],
        ))
}

/// Measure performance, analyze in parallel, and apply optimizations if needed.
pub fn content_optimization() -> WorkflowDefinition {
    WorkflowDefinition::new(CONTENT_OPTIMIZATION, "Content Optimization")
        .with_description("Improves existing content based on its performance")
        .with_step(WorkflowStep::agent("fetch-performance", "analytics-agent", "get_performance"))
        .with_step(WorkflowStep::parallel(
            "analyze-content",
            vec![
                WorkflowStep::agent("analyze-seo", "seo-optimizer", "analyze_seo"),
                WorkflowStep::agent("analyze-readability", "readability-analyzer", "analyze_readability"),
            ],
        ))
        .with_step(
            WorkflowStep::agent("apply-optimizations", "content-optimizer", "apply_optimizations")
                .when(Condition::expr("needsOptimization == true || engagementRate < 0.05"))
                .continue_on_error(),
        )
}

/// Every built-in definition.
pub fn builtin_workflows() -> Vec<WorkflowDefinition> {
    vec![
        content_creation(),
        user_behavior_analysis(),
        content_publishing(),
        trending_content(),
        content_optimization(),
    ]
}

/// Look up a built-in definition by id.
pub fn by_id(id: &str) -> Option<WorkflowDefinition> {
    match id {
        CONTENT_CREATION => Some(content_creation()),
        USER_BEHAVIOR_ANALYSIS => Some(user_behavior_analysis()),
        CONTENT_PUBLISHING => Some(content_publishing()),
        TRENDING_CONTENT => Some(trending_content()),
        CONTENT_OPTIMIZATION => Some(content_optimization()),
        _ => None,
    }
}
