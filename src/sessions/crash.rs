//! Crash detection
//!
//! Classifies a session's health from its activity cadence: byte activity
//! from the encoder pump and poll activity from the status endpoints. The
//! polling surface consults the verdict before doing anything stateful, so a
//! dead TV app stops producing fresh consumers instead of being polled
//! forever.

use serde::Serialize;

use crate::config::CrashConfig;
use crate::sessions::registry::ActivityView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    PossibleCrash,
    AndroidTvPossibleCrash,
    ClientTimeout,
    ConfirmedCrash,
    ConfirmedTimeoutCrash,
}

impl HealthVerdict {
    /// Terminal verdicts: the polling surface answers 410 and creates no
    /// state.
    pub fn is_confirmed(&self) -> bool {
        matches!(
            self,
            HealthVerdict::ConfirmedCrash | HealthVerdict::ConfirmedTimeoutCrash
        )
    }

    /// Soft verdicts: empty-but-valid replies, no new state.
    pub fn is_suspect(&self) -> bool {
        matches!(
            self,
            HealthVerdict::PossibleCrash
                | HealthVerdict::AndroidTvPossibleCrash
                | HealthVerdict::ClientTimeout
        )
    }

    pub fn reason(&self) -> &'static str {
        match self {
            HealthVerdict::Healthy => "healthy",
            HealthVerdict::PossibleCrash => "possible_crash",
            HealthVerdict::AndroidTvPossibleCrash => "android_tv_possible_crash",
            HealthVerdict::ClientTimeout => "client_timeout",
            HealthVerdict::ConfirmedCrash => "confirmed_crash",
            HealthVerdict::ConfirmedTimeoutCrash => "confirmed_timeout_crash",
        }
    }
}

pub struct CrashDetector {
    config: CrashConfig,
}

impl CrashDetector {
    pub fn new(config: CrashConfig) -> Self {
        Self { config }
    }

    /// Produce a verdict for one session. Terminal verdicts are evaluated
    /// before the softer timeout classes so a long-dead client cannot hide
    /// behind `client_timeout`.
    pub fn assess(&self, view: &ActivityView) -> HealthVerdict {
        let c = &self.config;
        let poll_fresh = view.poll_age.is_some_and(|age| age <= c.poll_fresh_window);
        let byte_fresh = view.byte_age.is_some_and(|age| age <= c.byte_fresh_window);
        // A session that never saw an event is as old as itself.
        let poll_gap = view.poll_age.unwrap_or(view.age);
        let byte_gap = view.byte_age.unwrap_or(view.age);

        if poll_fresh && byte_fresh {
            return HealthVerdict::Healthy;
        }

        // Client still polling but our upstream pipe has stalled.
        if poll_fresh && byte_gap >= c.byte_stall_window {
            return HealthVerdict::PossibleCrash;
        }

        // Nothing at all since admission.
        if view.poll_age.is_none() && view.byte_age.is_none() && view.age >= c.no_activity_window {
            return HealthVerdict::ConfirmedTimeoutCrash;
        }

        if poll_gap >= c.confirmed_crash_window || view.probe_failures >= c.max_probe_failures {
            return HealthVerdict::ConfirmedCrash;
        }

        if view.android_tv && poll_gap >= c.android_tv_poll_gap {
            return HealthVerdict::AndroidTvPossibleCrash;
        }

        if poll_gap >= c.client_timeout_window {
            return HealthVerdict::ClientTimeout;
        }

        HealthVerdict::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn detector() -> CrashDetector {
        CrashDetector::new(CrashConfig::default())
    }

    fn view(
        age_secs: u64,
        poll_secs: Option<u64>,
        byte_secs: Option<u64>,
    ) -> ActivityView {
        ActivityView {
            age: Duration::from_secs(age_secs),
            poll_age: poll_secs.map(Duration::from_secs),
            byte_age: byte_secs.map(Duration::from_secs),
            probe_failures: 0,
            android_tv: false,
        }
    }

    #[test]
    fn fresh_polls_and_bytes_are_healthy() {
        let verdict = detector().assess(&view(120, Some(1), Some(2)));
        assert_eq!(verdict, HealthVerdict::Healthy);
    }

    #[test]
    fn polling_with_stalled_pipe_is_possible_crash() {
        let verdict = detector().assess(&view(120, Some(1), Some(20)));
        assert_eq!(verdict, HealthVerdict::PossibleCrash);
    }

    #[test]
    fn short_stall_with_fresh_polls_stays_healthy() {
        // Byte gap between the fresh window and the stall window.
        let verdict = detector().assess(&view(120, Some(1), Some(8)));
        assert_eq!(verdict, HealthVerdict::Healthy);
    }

    // Poll-gap ladder with bytes still flowing: the verdict escalates from
    // healthy through client_timeout to confirmed as the client goes silent.
    #[rstest::rstest]
    #[case(1, HealthVerdict::Healthy)]
    #[case(12, HealthVerdict::Healthy)]
    #[case(29, HealthVerdict::Healthy)]
    #[case(35, HealthVerdict::ClientTimeout)]
    #[case(59, HealthVerdict::ClientTimeout)]
    #[case(65, HealthVerdict::ConfirmedCrash)]
    fn poll_gap_ladder(#[case] poll_secs: u64, #[case] expected: HealthVerdict) {
        let verdict = detector().assess(&view(300, Some(poll_secs), Some(1)));
        assert_eq!(verdict, expected);
    }

    #[test]
    fn android_tv_gets_the_short_leash() {
        let mut v = view(300, Some(12), Some(1));
        v.android_tv = true;
        assert_eq!(detector().assess(&v), HealthVerdict::AndroidTvPossibleCrash);

        // Same gap on a non-Android client is still fine.
        let v = view(300, Some(12), Some(1));
        assert_eq!(detector().assess(&v), HealthVerdict::Healthy);
    }

    #[test]
    fn consecutive_probe_failures_confirm_crash() {
        let mut v = view(300, Some(5), Some(1));
        v.probe_failures = 2;
        assert_eq!(detector().assess(&v), HealthVerdict::ConfirmedCrash);
    }

    #[test]
    fn silent_session_confirms_timeout_after_grace() {
        let verdict = detector().assess(&view(16, None, None));
        assert_eq!(verdict, HealthVerdict::ConfirmedTimeoutCrash);

        let verdict = detector().assess(&view(10, None, None));
        assert_eq!(verdict, HealthVerdict::Healthy);
    }
}
