//! Handshake state and the capability guards shared by both roles.

use crate::capability::{
    required_for_handler, required_for_notification, required_for_notification_handler,
    required_for_request, Capabilities, Capability, Role,
};
use crate::error::{McpError, McpResult};
use crate::protocol::{METHOD_INITIALIZE, METHOD_PING};
use tracing::error;

/// Handshake progress of one session. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Initialized,
}

/// Capabilities may only be declared before the handshake starts.
pub(crate) fn check_registration(role: Role, state: SessionState) -> McpResult<()> {
    if state == SessionState::Uninitialized {
        return Ok(());
    }
    error!(?role, ?state, "capabilities registered after the handshake started");
    Err(McpError::contract(format!(
        "cannot register capabilities in state {:?}",
        state
    )))
}

/// Guard for an outbound request against the remote peer's capabilities.
pub(crate) fn check_request(
    role: Role,
    state: SessionState,
    method: &str,
    remote: Option<&Capabilities>,
) -> McpResult<()> {
    if state != SessionState::Initialized && method != METHOD_INITIALIZE && method != METHOD_PING {
        error!(?role, ?state, method, "request sent before the session was initialized");
        return Err(McpError::NotInitialized(method.to_string()));
    }
    if let Some(capability) = required_for_request(role, method) {
        if !remote.is_some_and(|caps| caps.supports(capability)) {
            error!(?role, method, %capability, "peer does not support capability");
            return Err(McpError::capability_not_supported(capability.as_str(), method));
        }
    }
    Ok(())
}

/// Guard for an outbound notification against our own capabilities.
pub(crate) fn check_notification(role: Role, method: &str, local: &Capabilities) -> McpResult<()> {
    match required_for_notification(role, method) {
        Some(capability) if !local.supports(capability) => {
            error!(?role, method, %capability, "notification requires an unregistered capability");
            Err(McpError::capability_not_supported(capability.as_str(), method))
        }
        _ => Ok(()),
    }
}

/// Guard for installing a request handler against our own capabilities.
pub(crate) fn check_handler(role: Role, method: &str, local: &Capabilities) -> McpResult<()> {
    guard_handler(role, method, required_for_handler(role, method), local)
}

/// Guard for installing a notification handler against our own capabilities.
pub(crate) fn check_notification_handler(
    role: Role,
    method: &str,
    local: &Capabilities,
) -> McpResult<()> {
    guard_handler(role, method, required_for_notification_handler(role, method), local)
}

fn guard_handler(
    role: Role,
    method: &str,
    required: Option<Capability>,
    local: &Capabilities,
) -> McpResult<()> {
    match required {
        Some(capability) if !local.supports(capability) => {
            error!(?role, method, %capability, "handler requires an unregistered capability");
            Err(McpError::capability_not_supported(capability.as_str(), method))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_only_before_handshake() {
        assert!(check_registration(Role::Client, SessionState::Uninitialized).is_ok());
        for state in [SessionState::Initializing, SessionState::Initialized] {
            assert!(matches!(
                check_registration(Role::Client, state),
                Err(McpError::ContractViolation(_))
            ));
        }
    }

    #[test]
    fn test_request_guard() {
        let tools = Capabilities::new().with(Capability::Tools);

        assert!(matches!(
            check_request(Role::Client, SessionState::Initializing, "tools/list", Some(&tools)),
            Err(McpError::NotInitialized(_))
        ));
        assert!(check_request(Role::Client, SessionState::Uninitialized, "ping", None).is_ok());
        assert!(
            check_request(Role::Client, SessionState::Initialized, "tools/list", Some(&tools))
                .is_ok()
        );
        assert!(matches!(
            check_request(
                Role::Client,
                SessionState::Initialized,
                "prompts/list",
                Some(&tools)
            ),
            Err(McpError::CapabilityNotSupported { .. })
        ));
        assert!(
            check_request(Role::Client, SessionState::Initialized, "custom/thing", None).is_ok()
        );
    }

    #[test]
    fn test_notification_and_handler_guards() {
        let none = Capabilities::new();
        let logging = Capabilities::new().with(Capability::Logging);

        assert!(check_notification(Role::Server, "notifications/message", &none).is_err());
        assert!(check_notification(Role::Server, "notifications/message", &logging).is_ok());
        assert!(check_notification(Role::Server, "notifications/custom", &none).is_ok());

        assert!(check_handler(Role::Server, "tools/call", &none).is_err());
        assert!(check_handler(Role::Client, "sampling/createMessage", &none).is_err());
        assert!(check_handler(Role::Server, "custom/method", &none).is_ok());

        assert!(check_notification_handler(Role::Client, "notifications/message", &none).is_err());
        assert!(
            check_notification_handler(Role::Client, "notifications/message", &logging).is_ok()
        );
        assert!(check_notification_handler(
            Role::Server,
            "notifications/roots/list_changed",
            &none
        )
        .is_err());
        assert!(check_notification_handler(Role::Server, "notifications/custom", &none).is_ok());
    }
}
