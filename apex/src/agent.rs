//! The seam between the orchestrator's stage machine and whatever actually
//! does the work -- an external AI agent process, invoked once per stage.
//!
//! Nothing in this crate ships a concrete agent backend; [`NoopAgentRuntime`]
//! exists for tests and for a daemon running with no agent configured. A real
//! deployment injects its own [`AgentRuntime`] implementation that shells out
//! to (or otherwise invokes) the actual coding agent.

use async_trait::async_trait;

use apex_store::{Artifact, Checkpoint, LogEntry, Task};

use crate::domain::Stage;

#[derive(Debug, Clone)]
pub struct AgentContext {
    pub task: Task,
    pub stage: Stage,
    pub stage_index: usize,
    pub checkpoint: Option<Checkpoint>,
    /// Free-form context carried from a resumed session (see
    /// [`crate::orchestrator::Orchestrator::resume_paused_task`]) or from an
    /// iteration's feedback.
    pub context_summary: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub logs: Vec<LogEntry>,
    pub artifacts: Vec<Artifact>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub conversation_state: serde_json::Value,
    /// Name of a gate the stage wants approval on before the next stage
    /// runs. Only meaningful under `autonomy: supervised`.
    pub gate_name: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent invocation failed: {0}")]
    InvocationFailed(String),

    #[error("agent invocation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("agent invocation cancelled")]
    Cancelled,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run_stage(&self, ctx: AgentContext) -> Result<AgentOutcome, AgentError>;
}

/// Deterministic stand-in agent: marks every stage complete immediately with
/// no usage and no artifacts. Used in tests and as the orchestrator's
/// default when no real backend is wired in.
pub struct NoopAgentRuntime;

#[async_trait]
impl AgentRuntime for NoopAgentRuntime {
    async fn run_stage(&self, ctx: AgentContext) -> Result<AgentOutcome, AgentError> {
        Ok(AgentOutcome {
            conversation_state: serde_json::json!({ "stage": ctx.stage.name }),
            success: true,
            ..Default::default()
        })
    }
}
