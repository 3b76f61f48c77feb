//! Relay configuration.

use std::time::Duration;

/// How the receive loop treats a frame that does not parse as an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParseErrorPolicy {
    /// End the receive loop, which shuts the connection down.
    #[default]
    Fatal,
    /// Log and drop the frame, keep reading.
    Skip,
}

impl ParseErrorPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fatal" => Some(Self::Fatal),
            "skip" | "drop" => Some(Self::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upper bound on how long either loop waits before re-checking the
    /// termination flag.
    pub poll_interval: Duration,
    /// How long the acceptor waits for the initial frame.
    pub handshake_timeout: Duration,
    pub parse_errors: ParseErrorPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            handshake_timeout: Duration::from_secs(30),
            parse_errors: ParseErrorPolicy::Fatal,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `CRADLE_POLL_INTERVAL_MS`,
    /// `CRADLE_HANDSHAKE_TIMEOUT_MS` and `CRADLE_PARSE_ERRORS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    /// Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = read_millis(&lookup, "CRADLE_POLL_INTERVAL_MS") {
            config.poll_interval = ms;
        }
        if let Some(ms) = read_millis(&lookup, "CRADLE_HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout = ms;
        }
        if let Some(raw) = lookup("CRADLE_PARSE_ERRORS") {
            match ParseErrorPolicy::parse(&raw) {
                Some(policy) => config.parse_errors = policy,
                None => tracing::warn!(value = %raw, "Ignoring invalid CRADLE_PARSE_ERRORS"),
            }
        }

        config
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn with_parse_errors(mut self, policy: ParseErrorPolicy) -> Self {
        self.parse_errors = policy;
        self
    }
}

fn read_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        // a zero interval would spin the loops
        Ok(0) => {
            tracing::warn!(key, "Ignoring zero duration");
            None
        }
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid duration");
            None
        }
    }
}
