use serde::{Deserialize, Serialize};

/// Per-run budget ceilings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Budget {
    pub max_cost_usd: f64,
    pub max_tokens: u64,
    pub max_tool_minutes: f64,
    pub max_wallclock_minutes: f64,
    pub max_retries: u32,
}

impl Budget {
    pub fn new(max_cost_usd: f64, max_tokens: u64, max_retries: u32) -> Self {
        Self {
            max_cost_usd,
            max_tokens,
            max_tool_minutes: f64::MAX,
            max_wallclock_minutes: f64::MAX,
            max_retries,
        }
    }

    /// A well-formed budget has strictly positive ceilings, matching
    /// `createRun`'s precondition.
    pub fn is_well_formed(&self) -> bool {
        self.max_cost_usd > 0.0
            && self.max_tokens > 0
            && self.max_tool_minutes > 0.0
            && self.max_wallclock_minutes > 0.0
    }
}

/// Top-level Run state, following the engine's legal transition graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum RunState {
    Created,
    Intake,
    Ideation,
    Critique,
    Prd,
    BizDev,
    Arch,
    Build,
    StoryLoop,
    Qa,
    Aesthetic,
    Security,
    Release,
    Beta,
    Ga,
    Paused,
    Failed,
    Cancelled,
}

impl RunState {
    /// The ordered phase sequence, `Created` and the terminal/pause states
    /// excluded.
    pub const PHASE_ORDER: &'static [RunState] = &[
        RunState::Intake,
        RunState::Ideation,
        RunState::Critique,
        RunState::Prd,
        RunState::BizDev,
        RunState::Arch,
        RunState::Build,
        RunState::StoryLoop,
        RunState::Qa,
        RunState::Aesthetic,
        RunState::Security,
        RunState::Release,
        RunState::Beta,
        RunState::Ga,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Ga | RunState::Failed | RunState::Cancelled)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, RunState::Paused)
    }
}

/// A single execution of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub idea_spec_id: String,
    pub state: RunState,
    /// The state this run will resume into, set only while `Paused`.
    pub paused_from: Option<RunState>,
    pub budget: Budget,
    pub cumulative_cost_usd: f64,
    pub retry_counter: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Run {
    pub fn new(
        run_id: String,
        tenant_id: String,
        user_id: String,
        idea_spec_id: String,
        budget: Budget,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            run_id,
            tenant_id,
            user_id,
            idea_spec_id,
            state: RunState::Created,
            paused_from: None,
            budget,
            cumulative_cost_usd: 0.0,
            retry_counter: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Index of `state` within `PHASE_ORDER`, or `None` for non-phase states.
    pub fn phase_index(&self) -> Option<usize> {
        RunState::PHASE_ORDER.iter().position(|p| *p == self.state)
    }

    /// `cumulativeCostUSD <= maxCostUSD + eps` at gate boundaries.
    pub fn within_cost_budget(&self, eps: f64) -> bool {
        self.cumulative_cost_usd <= self.budget.max_cost_usd + eps
    }
}
