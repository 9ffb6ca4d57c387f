//! One-shot validation of the loaded configuration.

use serde::{Deserialize, Serialize};

use crate::config::TillerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

impl ValidationIssue {
    fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: ValidationLevel::Error,
            code,
            message: message.into(),
        }
    }

    fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: ValidationLevel::Warning,
            code,
            message: message.into(),
        }
    }
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues
        .iter()
        .any(|issue| issue.level == ValidationLevel::Error)
}

impl Validate for TillerConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let agents = &self.agents;

        if agents.command.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "agents.command.empty",
                "agent command is empty; nothing can be spawned",
            ));
        }
        if agents.max_parallel == 0 {
            issues.push(ValidationIssue::error(
                "agents.max_parallel.zero",
                "max_parallel must be greater than zero",
            ));
        }
        if agents.timeout_secs == 0 {
            issues.push(ValidationIssue::error(
                "agents.timeout.zero",
                "timeout_secs must be greater than zero",
            ));
        }
        if agents.idle_timeout_secs == 0 {
            issues.push(ValidationIssue::error(
                "agents.idle_timeout.zero",
                "idle_timeout_secs must be greater than zero",
            ));
        }
        if agents.idle_timeout_secs > agents.timeout_secs && agents.timeout_secs > 0 {
            issues.push(ValidationIssue::warning(
                "agents.idle_timeout.exceeds_timeout",
                format!(
                    "idle timeout {}s exceeds wall-clock timeout {}s; the watchdog can never fire",
                    agents.idle_timeout_secs, agents.timeout_secs
                ),
            ));
        }
        if agents.poll_interval_ms == 0 {
            issues.push(ValidationIssue::error(
                "agents.poll_interval.zero",
                "poll_interval_ms must be greater than zero",
            ));
        }
        if agents.env.keys().any(|key| key.trim().is_empty()) {
            issues.push(ValidationIssue::warning(
                "agents.env.empty_key",
                "agent env contains an empty variable name; it will be ignored",
            ));
        }

        if !(self.effort.default_hours > 0.0) {
            issues.push(ValidationIssue::error(
                "effort.default_hours.non_positive",
                "default_hours must be greater than zero",
            ));
        }
        if !(self.effort.hours_per_day > 0.0) {
            issues.push(ValidationIssue::error(
                "effort.hours_per_day.non_positive",
                "hours_per_day must be greater than zero",
            ));
        }
        for (size, hours) in &self.effort.sizes {
            if !(*hours >= 0.0) {
                issues.push(ValidationIssue::error(
                    "effort.sizes.negative",
                    format!("size '{size}' maps to a negative duration"),
                ));
            }
        }

        if self.merge.author_name.is_some() != self.merge.author_email.is_some() {
            issues.push(ValidationIssue::warning(
                "merge.author.incomplete",
                "author_name and author_email should be set together",
            ));
        }
        if let Some(main) = &self.merge.main_branch {
            if main.trim().is_empty() {
                issues.push(ValidationIssue::error(
                    "merge.main_branch.empty",
                    "main_branch must not be empty when set",
                ));
            }
        }

        if let Some(max) = self.gantt.display_max_hours {
            if max < self.gantt.display_min_hours {
                issues.push(ValidationIssue::error(
                    "gantt.display_max.below_min",
                    format!(
                        "display_max_hours {max} is below display_min_hours {}",
                        self.gantt.display_min_hours
                    ),
                ));
            }
        }
        if self.gantt.display_padding_hours < 0.0 {
            issues.push(ValidationIssue::error(
                "gantt.display_padding.negative",
                "display_padding_hours must not be negative",
            ));
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TillerConfig::default().validate().is_empty());
    }

    #[test]
    fn flags_zero_limits_as_errors() {
        let mut config = TillerConfig::default();
        config.agents.timeout_secs = 0;
        config.agents.poll_interval_ms = 0;
        let issues = config.validate();
        assert!(has_errors(&issues));
        assert!(issues.iter().any(|i| i.code == "agents.timeout.zero"));
        assert!(issues.iter().any(|i| i.code == "agents.poll_interval.zero"));
    }

    #[test]
    fn idle_timeout_above_wall_clock_is_a_warning() {
        let mut config = TillerConfig::default();
        config.agents.idle_timeout_secs = 7_200;
        let issues = config.validate();
        assert!(!has_errors(&issues));
        assert!(issues
            .iter()
            .any(|i| i.code == "agents.idle_timeout.exceeds_timeout"
                && i.level == ValidationLevel::Warning));
    }

    #[test]
    fn effort_table_rejects_negative_and_nan_hours() {
        let mut config = TillerConfig::default();
        config.effort.default_hours = f64::NAN;
        config.effort.sizes.insert("XS".to_string(), -1.0);
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.code == "effort.default_hours.non_positive"));
        assert!(issues.iter().any(|i| i.code == "effort.sizes.negative"));
    }

    #[test]
    fn gantt_cap_below_minimum_is_rejected() {
        let mut config = TillerConfig::default();
        config.gantt.display_max_hours = Some(0.5);
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.code == "gantt.display_max.below_min"));
    }
}
