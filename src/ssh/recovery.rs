use std::time::Duration;

use crate::config::ServiceModeProtocol;
use crate::error::SshError;
use crate::model::{ConnectionState, RecoveryReport};
use crate::ssh::buffer::tail;

pub(crate) trait ShellControl {
    fn send_line(&self, text: &str) -> Result<(), SshError>;
    fn pause(&self, duration: Duration) -> bool;
    /// Drops the channel without clearing buffers and opens a new one.
    /// Returns the output mark taken just before the new channel opened.
    fn reconnect(&self) -> Result<u64, SshError>;
    fn output_since(&self, mark: u64) -> String;
    fn shell_alive(&self) -> bool;
    fn enter(&self, state: ConnectionState);
    fn device_id(&self) -> &str;
}

pub(crate) struct RecoveryPlan<'a> {
    pub(crate) protocol: &'a ServiceModeProtocol,
    pub(crate) probe_delay: Duration,
    pub(crate) probe_window: usize,
}

pub(crate) fn recover_service_mode(
    shell: &dyn ShellControl,
    plan: &RecoveryPlan<'_>,
) -> Result<RecoveryReport, SshError> {
    let max_attempts = plan.protocol.max_attempts.max(1);
    let device = shell.device_id().to_string();

    for attempt in 1..=max_attempts {
        shell.enter(ConnectionState::Recovering);
        tracing::info!(%device, attempt, max_attempts, "service mode recovery attempt");

        for step in &plan.protocol.unlock_steps {
            if let Err(err) = shell.send_line(&step.command) {
                tracing::warn!(%device, %err, "unlock step not sent");
                break;
            }
            if !shell.pause(step.delay()) {
                return Err(SshError::Cancelled);
            }
        }
        if !shell.pause(plan.protocol.settle()) {
            return Err(SshError::Cancelled);
        }

        let mark = match shell.reconnect() {
            Ok(mark) => mark,
            Err(SshError::Cancelled) => return Err(SshError::Cancelled),
            Err(err) => {
                tracing::warn!(%device, attempt, %err, "reconnect during recovery failed");
                continue;
            }
        };
        if !shell.pause(plan.probe_delay) {
            return Err(SshError::Cancelled);
        }

        let fresh = shell.output_since(mark);
        if !plan.protocol.detect(tail(&fresh, plan.probe_window)) {
            shell.enter(ConnectionState::Connected);
            tracing::info!(%device, attempt, "service mode cleared");
            return Ok(RecoveryReport { attempts: attempt });
        }
        shell.enter(ConnectionState::ServiceModeDetected);
    }

    let final_state = if shell.shell_alive() {
        ConnectionState::ServiceModeDetected
    } else {
        ConnectionState::Disconnected
    };
    shell.enter(final_state);
    tracing::error!(%device, attempts = max_attempts, "service mode recovery gave up");
    Err(SshError::RecoveryFailed {
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnlockStep;
    use parking_lot::Mutex;

    struct ScriptedShell {
        clears_after: Option<u32>,
        fail_reconnects: u32,
        reconnects: Mutex<u32>,
        sent: Mutex<Vec<String>>,
        states: Mutex<Vec<ConnectionState>>,
        output: Mutex<String>,
        cancel_after_pauses: Option<usize>,
        pauses: Mutex<usize>,
    }

    impl ScriptedShell {
        fn new(clears_after: Option<u32>) -> Self {
            Self {
                clears_after,
                fail_reconnects: 0,
                reconnects: Mutex::new(0),
                sent: Mutex::new(Vec::new()),
                states: Mutex::new(Vec::new()),
                output: Mutex::new("servicemode> ".to_string()),
                cancel_after_pauses: None,
                pauses: Mutex::new(0),
            }
        }
    }

    impl ShellControl for ScriptedShell {
        fn send_line(&self, text: &str) -> Result<(), SshError> {
            self.sent.lock().push(text.to_string());
            Ok(())
        }

        fn pause(&self, _duration: Duration) -> bool {
            let mut pauses = self.pauses.lock();
            *pauses += 1;
            self.cancel_after_pauses.is_none_or(|limit| *pauses <= limit)
        }

        fn reconnect(&self) -> Result<u64, SshError> {
            let mut reconnects = self.reconnects.lock();
            *reconnects += 1;
            if *reconnects <= self.fail_reconnects {
                return Err(SshError::Network("refused".into()));
            }
            let mut output = self.output.lock();
            let mark = output.chars().count() as u64;
            let cleared = self.clears_after.is_some_and(|n| *reconnects >= n);
            output.push_str(if cleared { "esl@ap:~$ " } else { "servicemode> " });
            Ok(mark)
        }

        fn output_since(&self, mark: u64) -> String {
            self.output.lock().chars().skip(mark as usize).collect()
        }

        fn shell_alive(&self) -> bool {
            true
        }

        fn enter(&self, state: ConnectionState) {
            self.states.lock().push(state);
        }

        fn device_id(&self) -> &str {
            "AP-1"
        }
    }

    fn protocol() -> ServiceModeProtocol {
        ServiceModeProtocol {
            unlock_steps: vec![
                UnlockStep::new("extended matex2010", 0),
                UnlockStep::new("enableshell true", 0),
                UnlockStep::new("exit", 0),
                UnlockStep::new("exit", 0),
            ],
            settle_ms: 0,
            ..ServiceModeProtocol::default()
        }
    }

    fn plan(protocol: &ServiceModeProtocol) -> RecoveryPlan<'_> {
        RecoveryPlan {
            protocol,
            probe_delay: Duration::ZERO,
            probe_window: 1000,
        }
    }

    #[test]
    fn sends_unlock_sequence_and_succeeds() {
        let protocol = protocol();
        let shell = ScriptedShell::new(Some(1));
        let report = recover_service_mode(&shell, &plan(&protocol)).unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(
            *shell.sent.lock(),
            vec!["extended matex2010", "enableshell true", "exit", "exit"]
        );
        assert_eq!(
            shell.states.lock().last(),
            Some(&ConnectionState::Connected)
        );
    }

    #[test]
    fn old_marker_before_reconnect_is_ignored() {
        let protocol = protocol();
        let shell = ScriptedShell::new(Some(2));
        let report = recover_service_mode(&shell, &plan(&protocol)).unwrap();
        assert_eq!(report.attempts, 2);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let protocol = protocol();
        let shell = ScriptedShell::new(None);
        let err = recover_service_mode(&shell, &plan(&protocol)).unwrap_err();
        assert!(matches!(err, SshError::RecoveryFailed { attempts: 3 }));
        assert_eq!(*shell.reconnects.lock(), 3);
        assert_eq!(shell.sent.lock().len(), 12);
        assert_eq!(
            shell.states.lock().last(),
            Some(&ConnectionState::ServiceModeDetected)
        );
    }

    #[test]
    fn failed_reconnect_uses_up_an_attempt() {
        let protocol = protocol();
        let mut shell = ScriptedShell::new(Some(1));
        shell.fail_reconnects = 1;
        let report = recover_service_mode(&shell, &plan(&protocol)).unwrap();
        assert_eq!(report.attempts, 2);
    }

    #[test]
    fn cancellation_stops_immediately() {
        let protocol = protocol();
        let mut shell = ScriptedShell::new(None);
        shell.cancel_after_pauses = Some(2);
        assert!(matches!(
            recover_service_mode(&shell, &plan(&protocol)),
            Err(SshError::Cancelled)
        ));
        assert_eq!(*shell.reconnects.lock(), 0);
    }
}
