//! Secret flow tracking for substitutions.
//!
//! Resource outputs come from two channels: plain `values` and sensitive
//! `secrets`. A tracked substitution reports whether any placeholder was
//! answered from the secret channel so the caller can deliver the result as a
//! runtime secret instead of plaintext configuration. The signal is owned by
//! the call that produced it; nothing is shared between calls.
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Values,
    Secrets,
}

/// A single output value together with the channel that supplied it.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub value: Value,
    pub channel: Channel,
}

/// Result of a tracked substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub value: String,
    pub secret_touched: bool,
}

/// Per-call accumulator for the secret-access signal.
#[derive(Debug, Default)]
pub(crate) struct SecretWatch {
    touched: bool,
}

impl SecretWatch {
    pub(crate) fn observe(&mut self, channel: Channel) {
        if channel == Channel::Secrets {
            self.touched = true;
        }
    }

    pub(crate) fn finish(self, value: String) -> Resolved {
        Resolved {
            value,
            secret_touched: self.touched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_secret_channel_raises_the_signal() {
        let mut watch = SecretWatch::default();
        watch.observe(Channel::Values);
        assert!(!watch.finish("x".to_string()).secret_touched);

        let mut watch = SecretWatch::default();
        watch.observe(Channel::Values);
        watch.observe(Channel::Secrets);
        watch.observe(Channel::Secrets);
        let resolved = watch.finish("y".to_string());
        assert!(resolved.secret_touched);
        assert_eq!(resolved.value, "y");
    }
}
