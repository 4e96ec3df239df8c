//! Pure scheduling-order helpers, split out of `Store` so the ordering rule can be unit tested
//! without a database.

use chrono::{DateTime, Utc};

/// A job's scheduler-relevant fields, enough to compute its position relative to another job.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerKey<'a> {
    pub priority: i16,
    pub created_at: DateTime<Utc>,
    pub id: &'a str,
}

/// True if `candidate` is ordered strictly before `reference` by the scheduler's rule:
/// priority descending, then created_at ascending, ties broken by id ascending.
pub fn runs_before(candidate: SchedulerKey<'_>, reference: SchedulerKey<'_>) -> bool {
    if candidate.priority != reference.priority {
        return candidate.priority > reference.priority;
    }
    if candidate.created_at != reference.created_at {
        return candidate.created_at < reference.created_at;
    }
    candidate.id < reference.id
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key<'a>(priority: i16, secs: i64, id: &'a str) -> SchedulerKey<'a> {
        SchedulerKey {
            priority,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            id,
        }
    }

    #[test]
    fn higher_priority_runs_first() {
        let high = key(1, 100, "b");
        let low = key(0, 0, "a");
        assert!(runs_before(high, low));
        assert!(!runs_before(low, high));
    }

    #[test]
    fn equal_priority_orders_by_created_at() {
        let earlier = key(0, 0, "b");
        let later = key(0, 100, "a");
        assert!(runs_before(earlier, later));
        assert!(!runs_before(later, earlier));
    }

    #[test]
    fn ties_break_by_id() {
        let a = key(0, 0, "a");
        let b = key(0, 0, "b");
        assert!(runs_before(a, b));
        assert!(!runs_before(b, a));
    }
}
