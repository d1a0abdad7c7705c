use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// How a group's incident count is compared against its threshold.
/// Both comparisons are strict; a count equal to the threshold never
/// matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    GreaterThan,
    LessThan,
}

impl Comparator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::LessThan => "<",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            ">" => Some(Self::GreaterThan),
            "<" => Some(Self::LessThan),
            _ => None,
        }
    }
}

/// A group definition misconfigured in a way that can never match any
/// student. The run carries on; the group is recomputed to an empty
/// membership.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("unrecognized comparator {0:?}")]
    UnrecognizedComparator(String),
    #[error("empty roll state filter")]
    EmptyRollStates,
    #[error("non-positive window of {0} weeks")]
    NonPositiveWindow(i32),
}

/// A group row as stored: comparator and roll states are raw text and
/// are only validated when a rule is built from them.
#[derive(Debug, Clone)]
pub struct GroupDefinition {
    pub id: Uuid,
    pub name: String,
    pub incident_threshold: i32,
    pub comparator: String,
    pub roll_states: String,
    pub window_weeks: i32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub matched_student_count: Option<i32>,
}

impl GroupDefinition {
    /// Validate the stored fields into an evaluable rule.
    pub fn rule(&self) -> Result<GroupRule, RuleError> {
        let comparator = Comparator::parse(&self.comparator)
            .ok_or_else(|| RuleError::UnrecognizedComparator(self.comparator.clone()))?;

        let allowed_states: HashSet<String> = self
            .roll_states
            .split(',')
            .map(str::trim)
            .filter(|state| !state.is_empty())
            .map(str::to_string)
            .collect();
        if allowed_states.is_empty() {
            return Err(RuleError::EmptyRollStates);
        }

        if self.window_weeks <= 0 {
            return Err(RuleError::NonPositiveWindow(self.window_weeks));
        }

        Ok(GroupRule {
            comparator,
            incident_threshold: i64::from(self.incident_threshold),
            allowed_states,
            window_weeks: self.window_weeks,
        })
    }
}

/// The validated form of a group definition.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRule {
    pub comparator: Comparator,
    pub incident_threshold: i64,
    pub allowed_states: HashSet<String>,
    pub window_weeks: i32,
}

/// One recorded state for a student on a roll.
#[derive(Debug, Clone)]
pub struct RollStateRecord {
    pub roll_id: Uuid,
    pub student_id: Uuid,
    pub student_name: String,
    pub state: String,
}

/// A student whose aggregated incident count satisfied a group's rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudentMatch {
    pub student_id: Uuid,
    pub student_name: String,
    pub incident_count: i64,
}

/// Outcome of recomputing one group. `comparator` is `None` exactly
/// when the definition was misconfigured, in which case
/// `config_warning` describes the problem and `matches` is empty.
#[derive(Debug, Clone, Serialize)]
pub struct GroupRunResult {
    pub group_id: Uuid,
    pub group_name: String,
    pub comparator: Option<Comparator>,
    pub incident_threshold: i32,
    pub matches: Vec<StudentMatch>,
    pub config_warning: Option<String>,
}

/// A group whose evaluation or commit failed; its prior membership and
/// run metadata are untouched.
#[derive(Debug, Clone, Serialize)]
pub struct GroupRunFailure {
    pub group_id: Uuid,
    pub group_name: String,
    pub error: String,
}

/// Full outcome of one recomputation run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_at: DateTime<Utc>,
    pub groups: Vec<GroupRunResult>,
    pub failures: Vec<GroupRunFailure>,
}

/// A current member of a group, as served to downstream readers.
#[derive(Debug, Clone)]
pub struct MemberRecord {
    pub student_id: Uuid,
    pub full_name: String,
    pub email: String,
    pub incident_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> GroupDefinition {
        GroupDefinition {
            id: Uuid::new_v4(),
            name: "Frequent lates".to_string(),
            incident_threshold: 2,
            comparator: ">".to_string(),
            roll_states: "late, absent".to_string(),
            window_weeks: 4,
            last_run_at: None,
            matched_student_count: None,
        }
    }

    #[test]
    fn comparator_parses_source_symbols() {
        assert_eq!(Comparator::parse(">"), Some(Comparator::GreaterThan));
        assert_eq!(Comparator::parse("<"), Some(Comparator::LessThan));
        assert_eq!(Comparator::parse(" > "), Some(Comparator::GreaterThan));
        assert_eq!(Comparator::parse(">="), None);
        assert_eq!(Comparator::parse(""), None);
    }

    #[test]
    fn rule_splits_and_trims_roll_states() {
        let rule = definition().rule().unwrap();
        assert_eq!(rule.comparator, Comparator::GreaterThan);
        assert_eq!(rule.incident_threshold, 2);
        assert!(rule.allowed_states.contains("late"));
        assert!(rule.allowed_states.contains("absent"));
        assert_eq!(rule.allowed_states.len(), 2);
    }

    #[test]
    fn rule_rejects_unrecognized_comparator() {
        let mut def = definition();
        def.comparator = "gte".to_string();
        assert_eq!(
            def.rule(),
            Err(RuleError::UnrecognizedComparator("gte".to_string()))
        );
    }

    #[test]
    fn rule_rejects_empty_roll_states() {
        let mut def = definition();
        def.roll_states = " , ,".to_string();
        assert_eq!(def.rule(), Err(RuleError::EmptyRollStates));
    }

    #[test]
    fn rule_rejects_non_positive_window() {
        let mut def = definition();
        def.window_weeks = 0;
        assert_eq!(def.rule(), Err(RuleError::NonPositiveWindow(0)));
        def.window_weeks = -3;
        assert_eq!(def.rule(), Err(RuleError::NonPositiveWindow(-3)));
    }
}
