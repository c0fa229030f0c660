//! Pure state machine for one workflow run
//!
//! This module implements a pure functional state machine with NO I/O.
//! All state transitions are deterministic and testable.
//!
//! Key design principles:
//! - Pure function: transition(state, event) -> (state, actions)
//! - No async, no I/O, no browser access
//! - Invalid transitions leave the state untouched and say so (never panic)
//! - `Failed` is reachable from every non-terminal state

use serde::Serialize;
use tally_core::{DetectionOutcome, FailureKind, Stage};

/// Run state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum State {
    /// Created; browser session not yet in use
    Idle,
    /// Filling and submitting the login form
    LoggingIn,
    /// Landing indicator seen
    Authenticated,
    /// Submitting the report form
    Triggering,
    /// Running detection strategies
    Detecting,
    /// Exporting and waiting for the file
    Downloading,
    /// Artifact stored and token issued
    Registered { token: String },
    /// Cookies read after login
    Captured,
    /// Terminal failure, after the debug capture
    Failed {
        stage: Stage,
        kind: FailureKind,
        reason: String,
        debug_id: String,
    },
}

impl State {
    /// Workflow stage for non-terminal states
    pub fn stage(&self) -> Option<Stage> {
        match self {
            State::Idle => Some(Stage::Idle),
            State::LoggingIn => Some(Stage::LoggingIn),
            State::Authenticated => Some(Stage::Authenticated),
            State::Triggering => Some(Stage::Triggering),
            State::Detecting => Some(Stage::Detecting),
            State::Downloading => Some(Stage::Downloading),
            State::Registered { .. } | State::Captured | State::Failed { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage().is_none()
    }
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Browser session launched
    Start,
    LoginSucceeded { landing_url: String },
    /// Report workflow proceeds to the report page
    BeginTrigger,
    Triggered,
    Detected { outcome: DetectionOutcome },
    Registered { token: String },
    /// Cookie workflow finished
    CookiesCaptured { count: usize },
    /// A step failed and its debug capture is done
    StepFailed {
        kind: FailureKind,
        reason: String,
        debug_id: String,
    },
}

/// Actions to execute as side effects of transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Log activity
    LogActivity { message: String },
    /// Close the browser session now rather than at scope end
    ReleaseSession,
}

fn log(message: impl Into<String>) -> Action {
    Action::LogActivity {
        message: message.into(),
    }
}

/// Pure state transition function
///
/// Takes current state and event, returns new state and actions to execute.
/// This function is completely deterministic and has no side effects.
pub fn transition(state: State, event: Event) -> (State, Vec<Action>) {
    match (state, event) {
        (State::Idle, Event::Start) => (State::LoggingIn, vec![log("Session ready, logging in")]),

        (State::LoggingIn, Event::LoginSucceeded { landing_url }) => (
            State::Authenticated,
            vec![log(format!("Authenticated, landed on {}", landing_url))],
        ),

        (State::Authenticated, Event::BeginTrigger) => {
            (State::Triggering, vec![log("Submitting report form")])
        }

        (State::Authenticated, Event::CookiesCaptured { count }) => (
            State::Captured,
            vec![
                log(format!("Captured {} cookies", count)),
                Action::ReleaseSession,
            ],
        ),

        (State::Triggering, Event::Triggered) => (
            State::Detecting,
            vec![log("Report requested, detecting result")],
        ),

        (State::Detecting, Event::Detected { outcome }) => match detected_message(&outcome) {
            Some(message) => (State::Downloading, vec![log(message)]),
            None => ignored(State::Detecting, Event::Detected { outcome }),
        },

        (State::Downloading, Event::Registered { token }) => (
            State::Registered { token },
            vec![log("Artifact registered"), Action::ReleaseSession],
        ),

        (
            current,
            Event::StepFailed {
                kind,
                reason,
                debug_id,
            },
        ) if !current.is_terminal() => {
            let stage = current.stage().unwrap_or(Stage::Idle);
            let actions = vec![
                log(format!(
                    "Failed while {}: {} ({}), debug_id {}",
                    stage, kind, reason, debug_id
                )),
                Action::ReleaseSession,
            ];
            (
                State::Failed {
                    stage,
                    kind,
                    reason,
                    debug_id,
                },
                actions,
            )
        }

        (current, event) => ignored(current, event),
    }
}

fn ignored(state: State, event: Event) -> (State, Vec<Action>) {
    let message = format!("Ignored event {:?} in state {:?}", event, state);
    (state, vec![log(message)])
}

/// `None` for an outcome that gives the run nothing to download from
fn detected_message(outcome: &DetectionOutcome) -> Option<String> {
    match outcome {
        DetectionOutcome::NewWindowFound(handle) => {
            Some(format!("Report opened in new window {}", handle))
        }
        DetectionOutcome::UrlChanged(url) => Some(format!("Report page navigated to {}", url)),
        DetectionOutcome::ElementFound(locator) => {
            Some(format!("Report marker {} appeared", locator))
        }
        DetectionOutcome::NotDetected => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::WindowHandle;

    fn failed(kind: FailureKind) -> Event {
        Event::StepFailed {
            kind,
            reason: "boom".to_string(),
            debug_id: "dbg".to_string(),
        }
    }

    #[test]
    fn test_happy_path() {
        let events = vec![
            Event::Start,
            Event::LoginSucceeded {
                landing_url: "https://portal.test/home".to_string(),
            },
            Event::BeginTrigger,
            Event::Triggered,
            Event::Detected {
                outcome: DetectionOutcome::NewWindowFound(WindowHandle::new("w1")),
            },
            Event::Registered {
                token: "tok".to_string(),
            },
        ];
        let mut state = State::Idle;
        let mut last_actions = vec![];
        for event in events {
            let (next, actions) = transition(state, event);
            state = next;
            last_actions = actions;
        }
        assert_eq!(
            state,
            State::Registered {
                token: "tok".to_string()
            }
        );
        assert!(last_actions.contains(&Action::ReleaseSession));
    }

    #[test]
    fn test_failure_records_current_stage() {
        for (state, stage) in [
            (State::Idle, Stage::Idle),
            (State::LoggingIn, Stage::LoggingIn),
            (State::Triggering, Stage::Triggering),
            (State::Detecting, Stage::Detecting),
            (State::Downloading, Stage::Downloading),
        ] {
            let (next, actions) = transition(state, failed(FailureKind::DownloadTimeout));
            assert_eq!(
                next,
                State::Failed {
                    stage,
                    kind: FailureKind::DownloadTimeout,
                    reason: "boom".to_string(),
                    debug_id: "dbg".to_string(),
                }
            );
            assert!(actions.contains(&Action::ReleaseSession));
        }
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let registered = State::Registered {
            token: "tok".to_string(),
        };
        let (next, _) = transition(registered.clone(), failed(FailureKind::LoginFailed));
        assert_eq!(next, registered);

        let (next, _) = transition(State::Captured, Event::Start);
        assert_eq!(next, State::Captured);
    }

    #[test]
    fn test_out_of_order_event_is_ignored() {
        let (next, actions) = transition(State::LoggingIn, Event::Triggered);
        assert_eq!(next, State::LoggingIn);
        assert!(matches!(&actions[0], Action::LogActivity { message } if message.starts_with("Ignored")));
    }

    #[test]
    fn test_undetected_outcome_does_not_reach_download() {
        let (next, actions) = transition(
            State::Detecting,
            Event::Detected {
                outcome: DetectionOutcome::NotDetected,
            },
        );
        assert_eq!(next, State::Detecting);
        assert!(matches!(&actions[0], Action::LogActivity { message } if message.starts_with("Ignored")));
    }

    #[test]
    fn test_cookie_capture_path() {
        let (state, _) = transition(State::Idle, Event::Start);
        let (state, _) = transition(
            state,
            Event::LoginSucceeded {
                landing_url: "https://www.vollna.com/dashboard".to_string(),
            },
        );
        let (state, actions) = transition(state, Event::CookiesCaptured { count: 4 });
        assert_eq!(state, State::Captured);
        assert_eq!(actions[0], log("Captured 4 cookies"));
    }
}
