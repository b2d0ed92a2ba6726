//! Runtime settings for provisioning runs.
//!
//! The engine imposes no deadline of its own. A deadline is applied around
//! each dispatch only when one is configured, resolved in priority order:
//! 1. `--dispatch-timeout` CLI flag
//! 2. `SCORE_FLY_DISPATCH_TIMEOUT` environment variable (seconds)
use anyhow::{anyhow, Result};
use std::time::Duration;

pub const DISPATCH_TIMEOUT_ENV: &str = "SCORE_FLY_DISPATCH_TIMEOUT";

/// Set to `true` to log at debug level, like `--debug`.
pub const DEBUG_ENV: &str = "SCORE_FLY_DEBUG";

pub fn debug_enabled(flag: bool) -> bool {
    debug_from(flag, std::env::var(DEBUG_ENV).ok().as_deref())
}

fn debug_from(flag: bool, env_value: Option<&str>) -> bool {
    flag || env_value == Some("true")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound for a single provisioner call.
    pub dispatch_timeout: Option<Duration>,
}

impl EngineConfig {
    pub fn resolve(flag_secs: Option<u64>) -> Result<Self> {
        let env_value = std::env::var(DISPATCH_TIMEOUT_ENV).ok();
        Self::resolve_from(flag_secs, env_value.as_deref())
    }

    fn resolve_from(flag_secs: Option<u64>, env_value: Option<&str>) -> Result<Self> {
        let secs = match (flag_secs, env_value) {
            (Some(secs), _) => Some(secs),
            (None, Some(raw)) if !raw.trim().is_empty() => {
                Some(raw.trim().parse::<u64>().map_err(|_| {
                    anyhow!("{DISPATCH_TIMEOUT_ENV} must be a whole number of seconds (got {raw:?})")
                })?)
            }
            _ => None,
        };
        if secs == Some(0) {
            return Err(anyhow!("dispatch timeout must be greater than zero"));
        }
        Ok(EngineConfig {
            dispatch_timeout: secs.map(Duration::from_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_environment() {
        let config = EngineConfig::resolve_from(Some(5), Some("30")).unwrap();
        assert_eq!(config.dispatch_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn environment_used_when_flag_absent() {
        let config = EngineConfig::resolve_from(None, Some(" 30 ")).unwrap();
        assert_eq!(config.dispatch_timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            EngineConfig::resolve_from(None, None).unwrap(),
            EngineConfig::default()
        );
    }

    #[test]
    fn debug_env_only_accepts_true() {
        assert!(debug_from(true, None));
        assert!(debug_from(false, Some("true")));
        assert!(!debug_from(false, Some("1")));
        assert!(!debug_from(false, None));
    }

    #[test]
    fn rejects_zero_and_garbage() {
        assert!(EngineConfig::resolve_from(Some(0), None).is_err());
        assert!(EngineConfig::resolve_from(None, Some("soon")).is_err());
    }
}
