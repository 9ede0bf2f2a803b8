//! Scheduler configuration.
//!
//! The iteration caps bound how many drain passes one flush of a lane may
//! run before the remaining work is discarded. They can be set in code,
//! updated at runtime, or loaded from a JSON document:
//!
//! ```json
//! { "max_microtask_iterations": 500, "max_frame_iterations": 60 }
//! ```

use serde::{Deserialize, Serialize};

use super::Lane;
use crate::error::ReactiveError;

/// Default cap on microtask-lane drain passes per flush.
pub const DEFAULT_MAX_MICROTASK_ITERATIONS: usize = 1000;

/// Default cap on frame-lane drain passes per flush.
pub const DEFAULT_MAX_FRAME_ITERATIONS: usize = 100;

/// Runtime configuration of a [`Scheduler`](super::Scheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Drain passes allowed per microtask-lane flush.
    pub max_microtask_iterations: usize,

    /// Drain passes allowed per frame-lane flush.
    #[serde(alias = "max_raf_iterations")]
    pub max_frame_iterations: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_microtask_iterations: DEFAULT_MAX_MICROTASK_ITERATIONS,
            max_frame_iterations: DEFAULT_MAX_FRAME_ITERATIONS,
        }
    }
}

impl SchedulerConfig {
    /// Parse and validate a JSON configuration document.
    ///
    /// Missing fields keep their defaults.
    pub fn from_json(document: &str) -> Result<Self, ReactiveError> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that both caps allow at least one pass.
    pub fn validate(&self) -> Result<(), ReactiveError> {
        if self.max_microtask_iterations == 0 {
            return Err(ReactiveError::InvalidConfig(
                "max_microtask_iterations must be at least 1".into(),
            ));
        }
        if self.max_frame_iterations == 0 {
            return Err(ReactiveError::InvalidConfig(
                "max_frame_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Return a copy with `update` applied, validated.
    pub fn apply(&self, update: SchedulerConfigUpdate) -> Result<Self, ReactiveError> {
        let next = Self {
            max_microtask_iterations: update
                .max_microtask_iterations
                .unwrap_or(self.max_microtask_iterations),
            max_frame_iterations: update
                .max_frame_iterations
                .unwrap_or(self.max_frame_iterations),
        };
        next.validate()?;
        Ok(next)
    }

    /// The cap for `lane`.
    pub fn max_iterations(&self, lane: Lane) -> usize {
        match lane {
            Lane::Frame => self.max_frame_iterations,
            Lane::Microtask => self.max_microtask_iterations,
        }
    }
}

/// A partial configuration update; `None` fields are left unchanged.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfigUpdate {
    pub max_microtask_iterations: Option<usize>,
    #[serde(alias = "max_raf_iterations")]
    pub max_frame_iterations: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_caps() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_microtask_iterations, 1000);
        assert_eq!(config.max_frame_iterations, 100);
        assert_eq!(config.max_iterations(Lane::Frame), 100);
        assert_eq!(config.max_iterations(Lane::Microtask), 1000);
    }

    #[test]
    fn from_json_fills_missing_fields() {
        let config = SchedulerConfig::from_json(r#"{ "max_frame_iterations": 10 }"#).unwrap();
        assert_eq!(config.max_frame_iterations, 10);
        assert_eq!(config.max_microtask_iterations, 1000);
    }

    #[test]
    fn from_json_accepts_raf_alias() {
        let config = SchedulerConfig::from_json(r#"{ "max_raf_iterations": 7 }"#).unwrap();
        assert_eq!(config.max_frame_iterations, 7);
    }

    #[test]
    fn from_json_rejects_zero_caps() {
        let err = SchedulerConfig::from_json(r#"{ "max_microtask_iterations": 0 }"#).unwrap_err();
        assert!(matches!(err, ReactiveError::InvalidConfig(_)));
    }

    #[test]
    fn from_json_reports_parse_errors() {
        let err = SchedulerConfig::from_json("not json").unwrap_err();
        assert!(matches!(err, ReactiveError::ConfigParse(_)));
    }

    #[test]
    fn apply_keeps_unset_fields() {
        let config = SchedulerConfig::default()
            .apply(SchedulerConfigUpdate {
                max_microtask_iterations: Some(2),
                max_frame_iterations: None,
            })
            .unwrap();
        assert_eq!(config.max_microtask_iterations, 2);
        assert_eq!(config.max_frame_iterations, 100);

        assert!(config
            .apply(SchedulerConfigUpdate {
                max_frame_iterations: Some(0),
                ..Default::default()
            })
            .is_err());
    }
}
