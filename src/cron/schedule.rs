//! Schedule expression parsing and due-time evaluation

use super::ScheduleError;
use chrono::{DateTime, Utc};

/// Convert a schedule string into a 6-field cron expression.
///
/// Supports:
/// - Standard 5-field cron (`*/5 * * * *`), seconds set to 0
/// - 6-field cron with seconds (`0 */5 * * * *`)
/// - `@yearly`, `@monthly`, `@weekly`, `@daily`, `@hourly` style aliases
/// - `every N seconds|minutes|hours`
/// - `every minute`, `every hour`, `every day`, `hourly`, `daily`, `minutely`
/// - `every day at HH:MM`
pub fn normalize_schedule(input: &str) -> Result<String, ScheduleError> {
    let trimmed = input.trim();
    let invalid = |reason: &str| ScheduleError::InvalidSchedule {
        schedule: input.to_string(),
        reason: reason.to_string(),
    };

    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    if parts.len() == 5 {
        return Ok(format!("0 {}", parts.join(" ")));
    }
    if parts.len() == 6 {
        return Ok(parts.join(" "));
    }

    let lower = trimmed.to_lowercase();

    match lower.as_str() {
        "@yearly" | "@annually" => return Ok("0 0 0 1 1 *".to_string()),
        "@monthly" => return Ok("0 0 0 1 * *".to_string()),
        "@weekly" => return Ok("0 0 0 * * 0".to_string()),
        "@daily" | "@midnight" | "every day" | "daily" => return Ok("0 0 0 * * *".to_string()),
        "@hourly" | "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every minute" | "minutely" => return Ok("0 * * * * *".to_string()),
        _ => {}
    }

    if let Some(rest) = lower.strip_prefix("every ") {
        if let Some(at_part) = rest.strip_prefix("day at ") {
            let (hour, minute) = at_part
                .split_once(':')
                .ok_or_else(|| invalid("expected HH:MM"))?;
            let hour: u32 = hour.trim().parse().map_err(|_| invalid("bad hour"))?;
            let minute: u32 = minute.trim().parse().map_err(|_| invalid("bad minute"))?;
            if hour < 24 && minute < 60 {
                return Ok(format!("0 {} {} * * *", minute, hour));
            }
            return Err(invalid("time of day out of range"));
        }

        let words: Vec<&str> = rest.split_whitespace().collect();
        if words.len() == 2 {
            let n: u32 = words[0].parse().map_err(|_| invalid("bad interval"))?;
            if n == 0 {
                return Err(invalid("interval must be > 0"));
            }
            let unit = words[1].trim_end_matches('s');
            return match unit {
                "second" => Ok(format!("*/{} * * * * *", n)),
                "minute" => Ok(format!("0 */{} * * * *", n)),
                "hour" => Ok(format!("0 0 */{} * * *", n)),
                _ => Err(invalid("unknown interval unit")),
            };
        }
    }

    Err(invalid("unrecognized schedule format"))
}

/// Result of asking a schedule what is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Due {
    /// No occurrence between the baseline and now
    Nothing,
    /// Latest due occurrence, and how many earlier ones were passed over
    At {
        scheduled: DateTime<Utc>,
        missed: u32,
    },
    /// More occurrences elapsed than the configured limit
    TooManyMissed,
}

/// A parsed schedule
#[derive(Debug, Clone)]
pub struct Schedule {
    source: String,
    expression: String,
    cron: croner::Cron,
}

impl Schedule {
    pub fn parse(source: &str) -> Result<Self, ScheduleError> {
        let expression = normalize_schedule(source)?;
        let cron = expression
            .parse::<croner::Cron>()
            .map_err(|e| ScheduleError::InvalidSchedule {
                schedule: source.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            source: source.to_string(),
            expression,
            cron,
        })
    }

    /// The schedule as written
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Normalized 6-field expression
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.iter_after(after).next()
    }

    /// Latest occurrence in `(since, now]`
    pub fn due(&self, since: DateTime<Utc>, now: DateTime<Utc>, limit: u32) -> Due {
        let mut latest = None;
        let mut seen: u32 = 0;

        for next in self.cron.iter_after(since) {
            if next > now {
                break;
            }
            seen += 1;
            if seen > limit {
                return Due::TooManyMissed;
            }
            latest = Some(next);
        }

        match latest {
            Some(scheduled) => Due::At {
                scheduled,
                missed: seen - 1,
            },
            None => Due::Nothing,
        }
    }
}
