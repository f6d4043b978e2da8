use std::time::Duration;

/// Tunable timing for a `Replica`.
///
/// The defaults match the values commonly used for in-datacenter
/// clusters: an election timeout drawn uniformly from a 250-400ms
/// window, and a 100ms heartbeat period (roughly 2.5-4x shorter than
/// the minimum election timeout, which keeps a healthy leader from
/// ever being challenged).
#[derive(Clone, Debug)]
pub struct Config {
    /// Election timeouts are drawn uniformly from
    /// `[election_timeout.0, election_timeout.1)`.
    pub election_timeout: (Duration, Duration),

    /// Fixed period between leader heartbeats.
    pub heartbeat_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            election_timeout: (Duration::from_millis(250), Duration::from_millis(400)),
            heartbeat_timeout: Duration::from_millis(100),
        }
    }
}
