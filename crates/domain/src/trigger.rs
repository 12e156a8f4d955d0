use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use cron::Schedule;

use scheduler_core::{SchedulerError, SchedulerResult};

use crate::value_objects::TriggerType;

const ONCE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

impl TriggerType {
    /// 校验触发配置
    pub fn validate(&self, value: &str) -> SchedulerResult<()> {
        match self {
            TriggerType::Cron => parse_cron(value).map(|_| ()),
            TriggerType::Once => parse_once(value).map(|_| ()),
            TriggerType::FixedRate | TriggerType::FixedDelay => {
                self.fixed_period(value).map(|_| ())
            }
            TriggerType::Depend => parse_depend_parents(value).map(|_| ()),
        }
    }

    /// 计算base之后的下一次触发时间，依赖类型没有触发时间
    pub fn compute_next_trigger_time(
        &self,
        value: &str,
        base: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        match self {
            TriggerType::Cron => Ok(parse_cron(value)?.after(&base).next()),
            TriggerType::Once => {
                let time = parse_once(value)?;
                Ok((time > base).then_some(time))
            }
            TriggerType::FixedRate | TriggerType::FixedDelay => {
                let period = self.fixed_period(value)?;
                Ok(base.checked_add_signed(period))
            }
            TriggerType::Depend => Ok(None),
        }
    }

    /// 固定频率/延迟的周期
    pub fn fixed_period(&self, value: &str) -> SchedulerResult<Duration> {
        let invalid = |message: &str| SchedulerError::InvalidTrigger {
            trigger_type: self.to_string(),
            value: value.to_string(),
            message: message.to_string(),
        };
        if !self.is_fixed() {
            return Err(invalid("不是固定周期类型"));
        }
        let seconds = value
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid("周期必须是整数秒"))?;
        if seconds <= 0 {
            return Err(invalid("周期必须大于0"));
        }
        Ok(Duration::seconds(seconds))
    }
}

fn parse_cron(value: &str) -> SchedulerResult<Schedule> {
    Schedule::from_str(value.trim()).map_err(|e| SchedulerError::InvalidCron {
        expr: value.to_string(),
        message: e.to_string(),
    })
}

fn parse_once(value: &str) -> SchedulerResult<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Ok(time.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, ONCE_FORMAT)
        .map(|time| time.and_utc())
        .map_err(|e| SchedulerError::InvalidTrigger {
            trigger_type: TriggerType::Once.to_string(),
            value: value.to_string(),
            message: e.to_string(),
        })
}

/// 解析依赖类型的父作业ID列表，以逗号分隔，去重并保持顺序
pub fn parse_depend_parents(value: &str) -> SchedulerResult<Vec<i64>> {
    let mut parents = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let id = part.parse::<i64>().map_err(|_| SchedulerError::InvalidTrigger {
            trigger_type: TriggerType::Depend.to_string(),
            value: value.to_string(),
            message: format!("无效的父作业ID: {part}"),
        })?;
        if !parents.contains(&id) {
            parents.push(id);
        }
    }
    if parents.is_empty() {
        return Err(SchedulerError::InvalidTrigger {
            trigger_type: TriggerType::Depend.to_string(),
            value: value.to_string(),
            message: "父作业列表不能为空".to_string(),
        });
    }
    Ok(parents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cron_next_trigger_time() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 30).unwrap();
        let next = TriggerType::Cron
            .compute_next_trigger_time("0 * * * * *", base)
            .unwrap();
        assert_eq!(next, Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 1, 0).unwrap()));
    }

    #[test]
    fn test_invalid_cron() {
        let err = TriggerType::Cron.validate("not a cron").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_once_trigger() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = TriggerType::Once
            .compute_next_trigger_time("2024-06-01 12:00:00", base)
            .unwrap();
        assert_eq!(next, Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));

        let expired = TriggerType::Once
            .compute_next_trigger_time("2023-06-01T12:00:00Z", base)
            .unwrap();
        assert_eq!(expired, None);
    }

    #[test]
    fn test_fixed_period() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = TriggerType::FixedRate
            .compute_next_trigger_time("90", base)
            .unwrap();
        assert_eq!(next, Some(base + Duration::seconds(90)));

        assert!(TriggerType::FixedDelay.validate("0").is_err());
        assert!(TriggerType::FixedDelay.validate("abc").is_err());
        assert!(TriggerType::Cron.fixed_period("10").is_err());
    }

    #[test]
    fn test_depend_parents() {
        assert_eq!(parse_depend_parents("3, 1,3,,2").unwrap(), vec![3, 1, 2]);
        assert!(parse_depend_parents(" , ").is_err());
        assert!(parse_depend_parents("1,x").is_err());
        assert_eq!(
            TriggerType::Depend
                .compute_next_trigger_time("1", Utc::now())
                .unwrap(),
            None
        );
    }
}
