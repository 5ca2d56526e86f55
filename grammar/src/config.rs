use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when a received message does not match the transition that is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DivergencePolicy {
    /// Log a warning and advance to the end state of the transition anyway.
    #[default]
    Continue,
    /// Advance to the end state, then end the session.
    EndSession,
}

/// Parameters of automaton execution. Durations are given in milliseconds when the
/// configuration is read from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Delay applied after every message that is written or read.
    #[serde(with = "millis")]
    pub pacing: Duration,
    /// How long a reception waits before it reports that nothing was received.
    #[serde(with = "millis")]
    pub receive_timeout: Duration,
    /// Upper bound on the number of transitions executed in one session.
    pub max_steps: usize,
    /// Policy for messages that decode as a known symbol the transition does not accept.
    pub on_unexpected: DivergencePolicy,
    /// Policy for messages that do not decode as any known symbol.
    pub on_unknown: DivergencePolicy,
    /// End the session as soon as a reception times out without any bytes.
    pub end_on_silence: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(100),
            receive_timeout: Duration::from_secs(2),
            max_steps: 256,
            on_unexpected: DivergencePolicy::Continue,
            on_unknown: DivergencePolicy::Continue,
            end_on_silence: false,
        }
    }
}

impl ExecutionConfig {
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_max_steps(mut self, steps: usize) -> Self {
        self.max_steps = steps;
        self
    }

    pub fn with_divergence_policy(
        mut self,
        on_unexpected: DivergencePolicy,
        on_unknown: DivergencePolicy,
    ) -> Self {
        self.on_unexpected = on_unexpected;
        self.on_unknown = on_unknown;
        self
    }

    pub fn ending_on_silence(mut self) -> Self {
        self.end_on_silence = true;
        self
    }
}

/// Serializes durations as whole milliseconds, use with `#[serde(with = "grammar::millis")]`.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
