// Reconnection backoff state machine for long-lived client connections.
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Idle,
    Connecting,
    Connected,
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectEvent {
    /// Begin a connection attempt (initially, or once a backoff has elapsed).
    Start,
    Connected,
    ConnectFailed,
    ConnectionLost,
    Stop,
}

/// Backoff parameters.
///
/// ```
/// use broker::transport::tcp::ReconnectPolicy;
/// use std::time::Duration;
///
/// let policy = ReconnectPolicy::default();
/// assert_eq!(policy.initial_delay, Duration::from_secs(1));
/// assert_eq!(policy.max_delay, Duration::from_secs(3600));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Relative spread applied to each sleep, e.g. 0.1 for +/-10%.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            factor: std::f64::consts::E,
            jitter: 0.119,
        }
    }
}

impl ReconnectPolicy {
    /// `delay` spread by up to `jitter` either way. The stored delay is never
    /// jittered, so escalation stays monotonic.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter.is_finite() || self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + spread).max(0.0))
    }

    fn escalate(&self, delay: Duration) -> Duration {
        let factor = self.factor.max(1.0);
        let next = delay.as_secs_f64() * factor;
        if !next.is_finite() || next >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(next)
        }
    }
}

/// Owns the backoff delay across connection attempts.
///
/// Each failure yields the current delay and then escalates it
/// (`min(delay * factor, max)`); a successful connection resets it, so the
/// first failure after a success always waits `initial_delay`.
#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    state: ReconnectState,
    delay: Duration,
    retries: u32,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let delay = policy.initial_delay.min(policy.max_delay);
        Self {
            policy,
            state: ReconnectState::Idle,
            delay,
            retries: 0,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Applies `event`; the returned delay is `Some` exactly when the new
    /// state is [`ReconnectState::Backoff`]. Events that make no sense in the
    /// current state leave it unchanged.
    pub fn transition(&mut self, event: ReconnectEvent) -> (ReconnectState, Option<Duration>) {
        use ReconnectEvent as E;
        use ReconnectState as S;

        let (next, delay) = match (self.state, event) {
            (_, E::Stop) => (S::Idle, None),
            (S::Idle | S::Backoff, E::Start) => (S::Connecting, None),
            (S::Connecting, E::Connected) => {
                self.delay = self.policy.initial_delay.min(self.policy.max_delay);
                self.retries = 0;
                (S::Connected, None)
            }
            (S::Connecting, E::ConnectFailed) | (S::Connected, E::ConnectionLost) => {
                let delay = self.delay;
                self.delay = self.policy.escalate(delay);
                self.retries = self.retries.saturating_add(1);
                (S::Backoff, Some(delay))
            }
            (state, event) => {
                tracing::debug!(?state, ?event, "ignoring reconnect event");
                (state, None)
            }
        };
        self.state = next;
        (next, delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    fn fail(reconnector: &mut Reconnector) -> Duration {
        reconnector.transition(ReconnectEvent::Start);
        let (state, delay) = reconnector.transition(ReconnectEvent::ConnectFailed);
        assert_eq!(state, ReconnectState::Backoff);
        delay.expect("backoff delay")
    }

    #[test]
    fn backoff_is_non_decreasing_and_capped() {
        let mut reconnector = Reconnector::new(policy());
        let delays: Vec<_> = (0..8).map(|_| fail(&mut reconnector)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*delays.last().expect("delay"), Duration::from_millis(1000));
        assert_eq!(reconnector.retries(), 8);
    }

    #[test]
    fn success_resets_to_minimum() {
        let mut reconnector = Reconnector::new(policy());
        for _ in 0..4 {
            fail(&mut reconnector);
        }
        reconnector.transition(ReconnectEvent::Start);
        assert_eq!(reconnector.state(), ReconnectState::Connecting);
        assert_eq!(
            reconnector.transition(ReconnectEvent::Connected),
            (ReconnectState::Connected, None)
        );
        let (state, delay) = reconnector.transition(ReconnectEvent::ConnectionLost);
        assert_eq!(state, ReconnectState::Backoff);
        assert_eq!(delay, Some(Duration::from_millis(100)));
        assert_eq!(reconnector.retries(), 1);
    }

    #[test]
    fn out_of_place_events_are_ignored() {
        let mut reconnector = Reconnector::new(policy());
        assert_eq!(
            reconnector.transition(ReconnectEvent::ConnectionLost),
            (ReconnectState::Idle, None)
        );
        reconnector.transition(ReconnectEvent::Start);
        reconnector.transition(ReconnectEvent::Connected);
        assert_eq!(
            reconnector.transition(ReconnectEvent::ConnectFailed),
            (ReconnectState::Connected, None)
        );
        assert_eq!(
            reconnector.transition(ReconnectEvent::Stop),
            (ReconnectState::Idle, None)
        );
    }

    #[test]
    fn jitter_stays_within_spread() {
        let policy = ReconnectPolicy {
            jitter: 0.25,
            ..policy()
        };
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let slept = policy.jittered(base);
            assert!(slept >= Duration::from_millis(750), "{slept:?}");
            assert!(slept <= Duration::from_millis(1250), "{slept:?}");
        }
        assert_eq!(ReconnectPolicy { jitter: 0.0, ..policy }.jittered(base), base);
    }

    #[test]
    fn default_policy_matches_reference_values() {
        let policy = ReconnectPolicy::default();
        assert!((policy.factor - 2.718_281_828).abs() < 1e-6);
        assert!((policy.jitter - 0.119).abs() < f64::EPSILON);
    }
}
