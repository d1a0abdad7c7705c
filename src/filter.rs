use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{Comparator, GroupRule, RollStateRecord, StudentMatch};

/// Start of a group's trailing window: `now` minus the configured
/// number of weeks. A non-positive week count puts the cutoff at or
/// after `now`, which selects an empty window rather than failing.
pub fn window_cutoff(now: DateTime<Utc>, window_weeks: i32) -> DateTime<Utc> {
    now - Duration::days(i64::from(window_weeks) * 7)
}

/// Count qualifying incidents per student. A state row counts exactly
/// when its roll is in the window and its state is allowed; both
/// conditions are applied together over the same snapshot of rows.
/// Students with no qualifying incidents are absent from the map.
pub fn aggregate_incidents(
    events: &[RollStateRecord],
    in_window_rolls: &HashSet<Uuid>,
    allowed_states: &HashSet<String>,
) -> HashMap<Uuid, i64> {
    let mut counts = HashMap::new();
    for event in events {
        if in_window_rolls.contains(&event.roll_id) && allowed_states.contains(&event.state) {
            *counts.entry(event.student_id).or_insert(0) += 1;
        }
    }
    counts
}

/// Strict on both sides; a count equal to the threshold never matches.
pub fn threshold_matches(count: i64, comparator: Comparator, threshold: i64) -> bool {
    match comparator {
        Comparator::GreaterThan => count > threshold,
        Comparator::LessThan => count < threshold,
    }
}

/// Evaluate one group's rule over the in-window rolls and their state
/// rows, producing the group's full new membership ordered by incident
/// count descending, ties broken by student id.
pub fn evaluate_rule(
    rule: &GroupRule,
    in_window_rolls: &HashSet<Uuid>,
    events: &[RollStateRecord],
) -> Vec<StudentMatch> {
    let counts = aggregate_incidents(events, in_window_rolls, &rule.allowed_states);

    let mut names: HashMap<Uuid, &str> = HashMap::new();
    for event in events {
        names
            .entry(event.student_id)
            .or_insert(event.student_name.as_str());
    }

    let mut matches: Vec<StudentMatch> = counts
        .into_iter()
        .filter(|(_, count)| threshold_matches(*count, rule.comparator, rule.incident_threshold))
        .map(|(student_id, incident_count)| StudentMatch {
            student_id,
            student_name: names
                .get(&student_id)
                .copied()
                .unwrap_or_default()
                .to_string(),
            incident_count,
        })
        .collect();

    matches.sort_by(|a, b| {
        b.incident_count
            .cmp(&a.incident_count)
            .then(a.student_id.cmp(&b.student_id))
    });
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(n: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, n, 12, 0, 0).unwrap()
    }

    fn event(roll_id: Uuid, student_id: Uuid, name: &str, state: &str) -> RollStateRecord {
        RollStateRecord {
            roll_id,
            student_id,
            student_name: name.to_string(),
            state: state.to_string(),
        }
    }

    fn rule(comparator: Comparator, threshold: i64, states: &[&str]) -> GroupRule {
        GroupRule {
            comparator,
            incident_threshold: threshold,
            allowed_states: states.iter().map(|s| s.to_string()).collect(),
            window_weeks: 2,
        }
    }

    #[test]
    fn cutoff_subtracts_whole_weeks() {
        assert_eq!(window_cutoff(day(30), 2), day(16));
        assert_eq!(window_cutoff(day(30), 4), day(2));
    }

    #[test]
    fn non_positive_window_puts_cutoff_at_or_after_now() {
        let now = day(30);
        assert_eq!(window_cutoff(now, 0), now);
        assert!(window_cutoff(now, -1) > now);
    }

    #[test]
    fn equality_never_matches_either_comparator() {
        assert!(threshold_matches(3, Comparator::GreaterThan, 2));
        assert!(!threshold_matches(2, Comparator::GreaterThan, 2));
        assert!(threshold_matches(1, Comparator::LessThan, 2));
        assert!(!threshold_matches(2, Comparator::LessThan, 2));
    }

    #[test]
    fn state_outside_window_does_not_count() {
        let in_roll = Uuid::new_v4();
        let out_roll = Uuid::new_v4();
        let student = Uuid::new_v4();
        let events = vec![
            event(in_roll, student, "Avery Lee", "late"),
            event(out_roll, student, "Avery Lee", "late"),
        ];
        let in_window: HashSet<Uuid> = [in_roll].into_iter().collect();
        let allowed: HashSet<String> = ["late".to_string()].into_iter().collect();

        let counts = aggregate_incidents(&events, &in_window, &allowed);
        assert_eq!(counts.get(&student), Some(&1));
    }

    #[test]
    fn disallowed_state_in_window_does_not_count() {
        let roll = Uuid::new_v4();
        let student = Uuid::new_v4();
        let events = vec![
            event(roll, student, "Avery Lee", "late"),
            event(roll, student, "Avery Lee", "present"),
        ];
        let in_window: HashSet<Uuid> = [roll].into_iter().collect();
        let allowed: HashSet<String> = ["late".to_string()].into_iter().collect();

        let counts = aggregate_incidents(&events, &in_window, &allowed);
        assert_eq!(counts.get(&student), Some(&1));
    }

    #[test]
    fn empty_allowed_states_counts_nobody() {
        let roll = Uuid::new_v4();
        let events = vec![event(roll, Uuid::new_v4(), "Avery Lee", "late")];
        let in_window: HashSet<Uuid> = [roll].into_iter().collect();

        let counts = aggregate_incidents(&events, &in_window, &HashSet::new());
        assert!(counts.is_empty());
    }

    #[test]
    fn students_without_qualifying_incidents_are_absent() {
        let roll = Uuid::new_v4();
        let counted = Uuid::new_v4();
        let filtered = Uuid::new_v4();
        let events = vec![
            event(roll, counted, "Avery Lee", "late"),
            event(roll, filtered, "Jules Moreno", "present"),
        ];
        let in_window: HashSet<Uuid> = [roll].into_iter().collect();
        let allowed: HashSet<String> = ["late".to_string()].into_iter().collect();

        let counts = aggregate_incidents(&events, &in_window, &allowed);
        assert!(counts.contains_key(&counted));
        assert!(!counts.contains_key(&filtered));
    }

    // Two-week window ending at day 30: a roll completed on day 20 is in
    // window, one on day 10 is not.
    fn two_week_fixture() -> (HashSet<Uuid>, Vec<RollStateRecord>, Uuid) {
        let r1 = Uuid::new_v4();
        let r2 = Uuid::new_v4();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let cutoff = window_cutoff(day(30), 2);
        let rolls = [(r1, day(20)), (r2, day(10))];
        let in_window: HashSet<Uuid> = rolls
            .iter()
            .filter(|(_, completed_at)| *completed_at >= cutoff)
            .map(|(id, _)| *id)
            .collect();
        let events = vec![
            event(r1, s1, "Avery Lee", "late"),
            event(r1, s1, "Avery Lee", "late"),
            event(r2, s2, "Jules Moreno", "absent"),
        ];
        (in_window, events, s1)
    }

    #[test]
    fn two_lates_in_window_exceed_a_threshold_of_one() {
        let (in_window, events, s1) = two_week_fixture();
        let rule = rule(Comparator::GreaterThan, 1, &["late"]);

        let matches = evaluate_rule(&rule, &in_window, &events);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].student_id, s1);
        assert_eq!(matches[0].incident_count, 2);
        assert_eq!(matches[0].student_name, "Avery Lee");
    }

    #[test]
    fn count_equal_to_threshold_yields_empty_membership() {
        let (in_window, events, _) = two_week_fixture();
        let rule = rule(Comparator::GreaterThan, 2, &["late"]);

        let matches = evaluate_rule(&rule, &in_window, &events);
        assert!(matches.is_empty());
    }

    #[test]
    fn evaluation_is_deterministic_and_idempotent() {
        let roll = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let events = vec![
            event(roll, a, "Avery Lee", "late"),
            event(roll, b, "Jules Moreno", "late"),
            event(roll, b, "Jules Moreno", "late"),
        ];
        let in_window: HashSet<Uuid> = [roll].into_iter().collect();
        let rule = rule(Comparator::GreaterThan, 0, &["late"]);

        let first = evaluate_rule(&rule, &in_window, &events);
        let second = evaluate_rule(&rule, &in_window, &events);
        assert_eq!(first, second);
        assert_eq!(first[0].incident_count, 2);
        assert_eq!(first[1].incident_count, 1);
    }

    #[test]
    fn ties_are_ordered_by_student_id() {
        let roll = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let events = vec![
            event(roll, a, "Avery Lee", "late"),
            event(roll, b, "Jules Moreno", "late"),
        ];
        let in_window: HashSet<Uuid> = [roll].into_iter().collect();
        let rule = rule(Comparator::GreaterThan, 0, &["late"]);

        let matches = evaluate_rule(&rule, &in_window, &events);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].student_id, a.min(b));
        assert_eq!(matches[1].student_id, a.max(b));
    }
}
