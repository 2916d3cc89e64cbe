use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::JobId;

/// One upcoming fire in a dry-run preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedFire {
    pub at: DateTime<Utc>,
    pub job_id: JobId,
    pub expr: String,
}

/// Accept classic five-field expressions by pinning the seconds field to 0.
pub fn normalize(expr: &str) -> String {
    let expr = expr.trim();
    if expr.starts_with('@') {
        return expr.to_string();
    }
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Parse a recurrence expression.
pub fn parse(expr: &str) -> Result<CronSchedule> {
    if expr.trim().is_empty() {
        return Err(Error::InvalidExpression {
            expr: expr.to_string(),
            reason: "expression is empty".into(),
        });
    }
    CronSchedule::from_str(&normalize(expr)).map_err(|e| Error::InvalidExpression {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Fire times of `schedule` in `(from, from + hours]`.
pub fn upcoming_within(schedule: &CronSchedule, from: DateTime<Utc>, hours: u64) -> Vec<DateTime<Utc>> {
    let end = from + Duration::hours(hours.min(i64::MAX as u64) as i64);
    schedule.after(&from).take_while(|t| *t <= end).collect()
}

/// Calculate next run times for a set of jobs.
/// This is strictly a dry-run preview; unparsable expressions are skipped.
pub fn plan<'a>(jobs: impl IntoIterator<Item = (JobId, &'a str)>, hours: u64) -> Vec<PlannedFire> {
    let now = Utc::now();
    let mut preview = Vec::new();
    for (job_id, expr) in jobs {
        if let Ok(schedule) = parse(expr) {
            for at in upcoming_within(&schedule, now, hours) {
                preview.push(PlannedFire {
                    at,
                    job_id,
                    expr: expr.to_string(),
                });
            }
        }
    }
    // Sort by time
    preview.sort_by(|a, b| a.at.cmp(&b.at).then(a.job_id.cmp(&b.job_id)));
    preview
}
