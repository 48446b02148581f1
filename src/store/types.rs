use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub slug: String,
    pub repo_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_plan_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Frozen,
    Done,
    Cancelled,
}

impl PlanStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Frozen => "frozen",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    InProgress,
    Complete,
    Blocked,
}

impl PhaseStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: PhaseStatus,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: PlanStatus,
    #[serde(default)]
    pub phases: Vec<Phase>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    /// The phase in progress, else the first not-started phase whose
    /// dependencies are complete.
    pub fn current_phase(&self) -> Option<&Phase> {
        self.phases
            .iter()
            .find(|p| p.status == PhaseStatus::InProgress)
            .or_else(|| {
                self.phases.iter().find(|p| {
                    p.status == PhaseStatus::NotStarted
                        && p.depends_on.iter().all(|dep| {
                            self.phases
                                .iter()
                                .any(|q| &q.id == dep && q.status == PhaseStatus::Complete)
                        })
                })
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Resolved,
    Wontfix,
}

impl IssueStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Wontfix => "wontfix",
        }
    }

    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open | Self::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: IssueStatus,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doc {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLog {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub objective: String,
    pub summary: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Run counters for one profile or loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub total_runs: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_cycles: u64,
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tool_calls: BTreeMap<String, u64>,
}

/// One finished run, folded into [`Stats`].
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub success: bool,
    pub cycles: u64,
    pub cost: f64,
    pub tool_calls: BTreeMap<String, u64>,
}

impl Stats {
    pub fn record(&mut self, outcome: &RunOutcome) {
        self.total_runs += 1;
        if outcome.success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.total_cycles += outcome.cycles;
        self.total_cost += outcome.cost;
        self.last_run = Some(Utc::now());
        for (tool, count) in &outcome.tool_calls {
            *self.tool_calls.entry(tool.clone()).or_default() += count;
        }
    }
}

/// Which records a listing returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Records with no plan binding.
    Shared,
    /// Records bound to the given plan.
    Plan(String),
    /// Shared records plus those bound to the given plan.
    PlanAndShared(String),
    All,
}

impl Scope {
    pub fn matches(&self, plan_id: Option<&str>) -> bool {
        match self {
            Self::Shared => plan_id.is_none(),
            Self::Plan(id) => plan_id.is_some_and(|p| p.eq_ignore_ascii_case(id)),
            Self::PlanAndShared(id) => plan_id.is_none_or(|p| p.eq_ignore_ascii_case(id)),
            Self::All => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(id: &str, status: PhaseStatus, deps: &[&str]) -> Phase {
        Phase {
            id: id.into(),
            title: format!("phase {id}"),
            description: String::new(),
            status,
            priority: 0,
            depends_on: deps.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn current_phase_prefers_in_progress() {
        let now = Utc::now();
        let mut plan = Plan {
            id: "p".into(),
            title: "t".into(),
            description: String::new(),
            status: PlanStatus::Active,
            phases: vec![
                phase("1", PhaseStatus::Complete, &[]),
                phase("2", PhaseStatus::NotStarted, &["3"]),
                phase("3", PhaseStatus::NotStarted, &["1"]),
            ],
            created_at: now,
            updated_at: now,
        };
        assert_eq!(plan.current_phase().unwrap().id, "3");
        plan.phases[1].status = PhaseStatus::InProgress;
        assert_eq!(plan.current_phase().unwrap().id, "2");
    }

    #[test]
    fn scope_matching() {
        assert!(Scope::Shared.matches(None));
        assert!(!Scope::Shared.matches(Some("a")));
        assert!(Scope::Plan("a".into()).matches(Some("A")));
        assert!(Scope::PlanAndShared("a".into()).matches(None));
        assert!(!Scope::PlanAndShared("a".into()).matches(Some("b")));
    }

    #[test]
    fn stats_accumulate_tools() {
        let mut stats = Stats::default();
        let mut outcome = RunOutcome {
            success: true,
            cycles: 1,
            cost: 0.5,
            ..RunOutcome::default()
        };
        outcome.tool_calls.insert("Bash".into(), 2);
        stats.record(&outcome);
        outcome.success = false;
        stats.record(&outcome);
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.tool_calls["Bash"], 4);
        assert!((stats.total_cost - 1.0).abs() < f64::EPSILON);
    }
}
