use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tracing::debug;

use scheduler_core::models::schedule::as_quartz_cron_expression;
use scheduler_core::{Result, SchedulerError};

const UNIX_CRON_FIELDS: usize = 5;

/// CRON表达式解析和下次触发时间计算
///
/// 输入是经典的5字段Unix表达式，解析前在前面补上秒字段 "0 "。
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
}

impl CronScheduler {
    pub fn new(cron_expr: &str, timezone: &str) -> Result<Self> {
        let schedule = parse_unix_expression(cron_expr)?;
        let timezone = parse_timezone(timezone)?;
        Ok(Self {
            expression: cron_expr.trim().to_string(),
            schedule,
            timezone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// `from` 之后（不含）的下一次触发时间，按调度所在时区解释表达式
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = from.with_timezone(&self.timezone);
        self.schedule
            .after(&local)
            .next()
            .map(|next| next.with_timezone(&Utc))
    }

    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let local = from.with_timezone(&self.timezone);
        self.schedule
            .after(&local)
            .take(count)
            .map(|t| t.with_timezone(&Utc))
            .collect()
    }

    pub fn time_until_next_execution(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_execution_time(now).map(|next| next - now)
    }

    /// `last` 之后、`now` 之前（含）是否有应当触发的时间点
    pub fn should_trigger(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.next_execution_time(last) {
            Some(next) => {
                let due = next <= now;
                if due {
                    debug!(
                        "CRON {} 到达触发时间: {}",
                        self.expression,
                        next.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                }
                due
            }
            None => false,
        }
    }
}

/// 验证5字段CRON表达式
pub fn validate_cron_expression(cron_expr: &str) -> Result<()> {
    parse_unix_expression(cron_expr).map(|_| ())
}

pub fn validate_timezone(timezone: &str) -> Result<()> {
    parse_timezone(timezone).map(|_| ())
}

fn parse_unix_expression(cron_expr: &str) -> Result<Schedule> {
    let fields = cron_expr.split_whitespace().count();
    if fields != UNIX_CRON_FIELDS {
        return Err(SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: format!("需要 {UNIX_CRON_FIELDS} 个字段，实际 {fields} 个"),
        });
    }
    let quartz = as_quartz_cron_expression(cron_expr);
    Schedule::from_str(&quartz).map_err(|e| SchedulerError::InvalidCron {
        expr: cron_expr.to_string(),
        message: e.to_string(),
    })
}

fn parse_timezone(timezone: &str) -> Result<Tz> {
    timezone
        .parse()
        .map_err(|_| SchedulerError::InvalidTimezone(timezone.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn test_prefix_accepts_valid_unix_expressions() {
        for expr in ["* * * * *", "0 9 * * MON-FRI", "*/15 0-6 1,15 * *", "30 2 * 1-6 *"] {
            assert!(validate_cron_expression(expr).is_ok(), "{expr}");
            assert_eq!(as_quartz_cron_expression(expr), format!("0 {expr}"));
        }
    }

    #[test]
    fn test_rejects_invalid_expressions() {
        for expr in ["", "* * * *", "0 0 9 * * MON", "61 * * * *", "* 25 * * *", "x y z a b"] {
            assert!(
                matches!(
                    validate_cron_expression(expr),
                    Err(SchedulerError::InvalidCron { .. })
                ),
                "{expr}"
            );
        }
    }

    #[test]
    fn test_next_weekday_morning() {
        let scheduler = CronScheduler::new("0 9 * * MON-FRI", "UTC").unwrap();
        // 2024-01-06 是周六
        let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).unwrap();
        let next = scheduler.next_execution_time(saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);
        assert_eq!(next.minute(), 0);
        assert_eq!(next.second(), 0);

        let upcoming = scheduler.upcoming_times(saturday, 5);
        assert_eq!(upcoming.len(), 5);
        assert_eq!(upcoming[4].weekday(), Weekday::Fri);
    }

    #[test]
    fn test_timezone_is_applied() {
        let scheduler = CronScheduler::new("0 9 * * *", "Asia/Shanghai").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let next = scheduler.next_execution_time(from).unwrap();
        // 上海 09:00 = UTC 01:00
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap());

        assert!(matches!(
            CronScheduler::new("* * * * *", "Mars/Olympus"),
            Err(SchedulerError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_should_trigger() {
        let scheduler = CronScheduler::new("*/5 * * * *", "UTC").unwrap();
        let last = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert!(!scheduler.should_trigger(last, last + Duration::minutes(4)));
        assert!(scheduler.should_trigger(last, last + Duration::minutes(5)));
        assert_eq!(
            scheduler.time_until_next_execution(last),
            Some(Duration::minutes(5))
        );
    }
}
