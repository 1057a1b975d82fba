use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

/// Proxy lifecycle relative to the routing host. `Registered` is the only
/// state in which intent flows out immediately; everything else buffers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RegistrationState {
    Deregistered,
    Assigning,
    Assigned,
    Registering,
    Registered,
}

/// Current state plus bounded waiting for transitions, used by `stop` to
/// synchronize with an in-flight registration or deregistration.
pub(crate) struct StateTracker {
    tx: watch::Sender<RegistrationState>,
}

impl StateTracker {
    pub fn new() -> StateTracker {
        StateTracker {
            tx: watch::Sender::new(RegistrationState::Deregistered),
        }
    }

    pub fn get(&self) -> RegistrationState {
        *self.tx.borrow()
    }

    pub fn set(&self, new_state: RegistrationState) {
        self.tx.send_if_modified(|state| {
            if *state == new_state {
                false
            } else {
                debug!("registration state {:?} -> {:?}", *state, new_state);
                *state = new_state;
                true
            }
        });
    }

    /// Waits until the state leaves `state`, up to `timeout`. Returns false
    /// on timeout.
    pub async fn wait_to_leave(&self, state: RegistrationState, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s != state))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_to_leave_times_out() {
        let tracker = StateTracker::new();
        tracker.set(RegistrationState::Registering);
        assert!(
            !tracker
                .wait_to_leave(RegistrationState::Registering, Duration::from_millis(100))
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_to_leave_sees_transition() {
        let tracker = std::sync::Arc::new(StateTracker::new());
        tracker.set(RegistrationState::Registering);

        let waiter = tracker.clone();
        let wait = tokio::spawn(async move {
            waiter
                .wait_to_leave(RegistrationState::Registering, Duration::from_secs(1))
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.set(RegistrationState::Registered);
        assert!(wait.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_to_leave_immediate_when_already_left() {
        let tracker = StateTracker::new();
        assert!(
            tracker
                .wait_to_leave(RegistrationState::Registering, Duration::from_millis(1))
                .await
        );
    }
}
