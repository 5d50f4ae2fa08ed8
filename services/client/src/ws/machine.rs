//! Connection lifecycle and inbound classification.
//!
//! `Idle -> Connecting -> Open -> Closing -> Closed`, with `Faulted` entered on
//! connect or send failure and torn down exactly like `Closing`. A closed
//! connection can be reopened.

use super::protocol::InboundEnvelope;
use crate::{config::ConfigError, error::SessionError};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Faulted,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Faulted => "faulted",
        }
    }
}

/// The realtime endpoint for a backend base URL, with `http(s)` mapped to `ws(s)`.
pub fn realtime_url(backend_url: &str) -> String {
    let base = backend_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/v1/realtime")
}

#[derive(Debug)]
pub struct ProtocolMachine {
    state: ConnectionState,
}

impl Default for ProtocolMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Only an open connection accepts outbound envelopes.
    pub fn can_send(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// `Idle | Closed -> Connecting`. Returns the realtime URL to dial.
    pub fn begin_connect(&mut self, backend_url: Option<&str>) -> Result<String, SessionError> {
        if !matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
            return Err(self.invalid("connect"));
        }
        let backend_url = backend_url
            .ok_or_else(|| ConfigError::MissingVar("PARLEY_BACKEND_URL".to_string()))?;
        self.state = ConnectionState::Connecting;
        Ok(realtime_url(backend_url))
    }

    /// `Connecting -> Open` once the transport handshake succeeded.
    pub fn opened(&mut self) -> Result<(), SessionError> {
        if self.state != ConnectionState::Connecting {
            return Err(self.invalid("open"));
        }
        self.state = ConnectionState::Open;
        Ok(())
    }

    /// `Connecting | Open -> Faulted`. Returns false if there was nothing live to fault.
    pub fn fault(&mut self) -> bool {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
            self.state = ConnectionState::Faulted;
            true
        } else {
            false
        }
    }

    /// `Connecting | Open | Faulted -> Closing`. Returns whether teardown is needed.
    pub fn begin_close(&mut self) -> bool {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Faulted
        ) {
            self.state = ConnectionState::Closing;
            true
        } else {
            false
        }
    }

    /// `Closing -> Closed`.
    pub fn closed(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Parses one inbound text frame into its `type` string and envelope.
    ///
    /// Malformed payloads are logged and dropped without touching the
    /// connection state.
    pub fn classify(raw: &str) -> Option<(String, InboundEnvelope)> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Dropping inbound payload that is not valid JSON");
                return None;
            }
        };
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match serde_json::from_value(value) {
            Ok(envelope) => Some((kind, envelope)),
            Err(e) => {
                warn!(%kind, error = %e, "Dropping inbound envelope with unexpected shape");
                None
            }
        }
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        SessionError::InvalidState {
            action,
            state: self.state.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_url() {
        assert_eq!(
            realtime_url("http://localhost:8000/"),
            "ws://localhost:8000/v1/realtime"
        );
        assert_eq!(
            realtime_url("https://unmute.sh"),
            "wss://unmute.sh/v1/realtime"
        );
        assert_eq!(realtime_url("ws://host"), "ws://host/v1/realtime");
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let mut machine = ProtocolMachine::new();
        assert_eq!(machine.state(), ConnectionState::Idle);

        let url = machine.begin_connect(Some("http://localhost:8000")).unwrap();
        assert_eq!(url, "ws://localhost:8000/v1/realtime");
        assert!(!machine.can_send());

        machine.opened().unwrap();
        assert!(machine.can_send());

        assert!(machine.begin_close());
        assert_eq!(machine.state(), ConnectionState::Closing);
        assert!(!machine.can_send());
        machine.closed();
        assert_eq!(machine.state(), ConnectionState::Closed);

        machine.begin_connect(Some("http://localhost:8000")).unwrap();
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_connect_without_endpoint_fails_fast() {
        let mut machine = ProtocolMachine::new();
        let err = machine.begin_connect(None).unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));
        assert_eq!(machine.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let mut machine = ProtocolMachine::new();
        machine.begin_connect(Some("http://h")).unwrap();
        let err = machine.begin_connect(Some("http://h")).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                action: "connect",
                state: "connecting"
            }
        ));
    }

    #[test]
    fn test_fault_tears_down_like_close() {
        let mut machine = ProtocolMachine::new();
        machine.begin_connect(Some("http://h")).unwrap();
        machine.opened().unwrap();
        assert!(machine.fault());
        assert_eq!(machine.state(), ConnectionState::Faulted);
        assert!(!machine.can_send());
        assert!(machine.begin_close());
        machine.closed();
        assert!(!machine.fault());
        assert!(!machine.begin_close());
    }

    #[test]
    fn test_classify() {
        let (kind, envelope) =
            ProtocolMachine::classify(r#"{"type":"response.text.delta","delta":"Hi"}"#).unwrap();
        assert_eq!(kind, "response.text.delta");
        assert_eq!(
            envelope,
            InboundEnvelope::TextDelta {
                delta: "Hi".to_string()
            }
        );

        assert!(ProtocolMachine::classify("{not json").is_none());
        assert!(ProtocolMachine::classify(r#"{"type":"response.text.delta"}"#).is_none());

        let (kind, envelope) = ProtocolMachine::classify(r#"{"type":"future.event"}"#).unwrap();
        assert_eq!(kind, "future.event");
        assert_eq!(envelope, InboundEnvelope::Unknown);
    }
}
