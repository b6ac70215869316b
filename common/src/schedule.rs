// Cron schedule parsing and next-fire calculation. Evaluation is UTC-only;
// user-facing expressions are classic 5-field cron (minute hour dom month
// dow), widened with a zero seconds field before parsing.

use crate::errors::ScheduleError;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Parse a 5-field cron expression
pub fn parse_cron(expression: &str) -> Result<CronSchedule, ScheduleError> {
    let field_count = expression.split_whitespace().count();
    if field_count != 5 {
        return Err(ScheduleError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: format!("expected 5 fields, found {}", field_count),
        });
    }
    let widened = format!("0 {}", expression);
    CronSchedule::from_str(&widened).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Validate without keeping the parsed schedule
pub fn validate_cron(expression: &str) -> Result<(), ScheduleError> {
    parse_cron(expression).map(|_| ())
}

/// Next fire instant strictly after `after`
pub fn next_fire(
    schedule: &CronSchedule,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| ScheduleError::NoNextExecution(schedule.to_string()))
}
