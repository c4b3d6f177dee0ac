//! Error types for the XMPP server core.
//!
//! Every failure that reaches a client is expressed as an RFC 6120 stanza
//! error. Internal failures (storage, cancellation, programming bugs) are
//! folded into `internal-server-error` when converted with
//! [`XmppError::to_stanza_error`].

use minidom::Element;
use thiserror::Error;
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

/// XMPP server errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Resource conflict (e.g., duplicate resource binding)
    #[error("Resource conflict: {0}")]
    ResourceConflict(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// The operation's context was cancelled
    #[error("Operation canceled")]
    Canceled,

    /// The operation's deadline elapsed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Stanza error (sent back to the requesting entity)
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
        /// Optional application-specific condition element
        application: Option<Element>,
    },
}

impl XmppError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a new timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a stanza error with an arbitrary condition.
    pub fn stanza(
        condition: StanzaErrorCondition,
        error_type: StanzaErrorType,
        text: Option<String>,
    ) -> Self {
        Self::Stanza {
            condition,
            error_type,
            text,
            application: None,
        }
    }

    /// Attach an application-specific condition element.
    ///
    /// Has no effect on non-stanza errors.
    pub fn with_application(mut self, element: Element) -> Self {
        if let Self::Stanza { application, .. } = &mut self {
            *application = Some(element);
        }
        self
    }

    /// Create a stanza error for 'not-authorized'.
    pub fn not_authorized(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::NotAuthorized,
            StanzaErrorType::Auth,
            text,
        )
    }

    /// Create a stanza error for 'bad-request'.
    pub fn bad_request(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::BadRequest, StanzaErrorType::Modify, text)
    }

    /// Create a stanza error for 'item-not-found'.
    pub fn item_not_found(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ItemNotFound, StanzaErrorType::Cancel, text)
    }

    /// Create a stanza error for 'feature-not-implemented'.
    pub fn feature_not_implemented(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::FeatureNotImplemented,
            StanzaErrorType::Cancel,
            text,
        )
    }

    /// Create a stanza error for 'forbidden'.
    pub fn forbidden(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::Forbidden, StanzaErrorType::Auth, text)
    }

    /// Create a stanza error for 'conflict'.
    pub fn conflict(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::Conflict, StanzaErrorType::Cancel, text)
    }

    /// Create a stanza error for 'registration-required'.
    pub fn registration_required(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::RegistrationRequired,
            StanzaErrorType::Auth,
            text,
        )
    }

    /// Create a stanza error for 'internal-server-error'.
    pub fn internal_server_error(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::InternalServerError,
            StanzaErrorType::Wait,
            text,
        )
    }

    /// Create a stanza error for 'resource-constraint'.
    pub fn resource_constraint(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::ResourceConstraint,
            StanzaErrorType::Wait,
            text,
        )
    }

    /// Create a stanza error for 'jid-malformed'.
    pub fn jid_malformed(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::JidMalformed, StanzaErrorType::Modify, text)
    }

    /// Create a stanza error for 'service-unavailable'.
    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::ServiceUnavailable,
            StanzaErrorType::Cancel,
            text,
        )
    }

    /// Create a stanza error for 'remote-server-not-found'.
    pub fn remote_server_not_found(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::RemoteServerNotFound,
            StanzaErrorType::Cancel,
            text,
        )
    }

    /// Create a stanza error for 'not-allowed'.
    pub fn not_allowed(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::NotAllowed, StanzaErrorType::Cancel, text)
    }

    /// Create a stanza error for 'not-acceptable'.
    pub fn not_acceptable(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::NotAcceptable, StanzaErrorType::Modify, text)
    }

    /// Create a stanza error for 'unexpected-request'.
    pub fn unexpected_request(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::UnexpectedRequest,
            StanzaErrorType::Cancel,
            text,
        )
    }

    /// The stanza condition this error carries, if it is a stanza error.
    pub fn condition(&self) -> Option<StanzaErrorCondition> {
        match self {
            Self::Stanza { condition, .. } => Some(*condition),
            _ => None,
        }
    }

    /// Whether this error is a client-facing stanza error rather than an
    /// internal failure that should be logged.
    pub fn is_stanza_error(&self) -> bool {
        matches!(self, Self::Stanza { .. })
    }

    /// Convert into the wire representation used in error replies.
    pub fn to_stanza_error(&self) -> StanzaError {
        let (condition, error_type, text, application) = match self {
            Self::Stanza {
                condition,
                error_type,
                text,
                application,
            } => (*condition, *error_type, text.clone(), application.clone()),
            Self::ResourceConflict(msg) => (
                StanzaErrorCondition::Conflict,
                StanzaErrorType::Cancel,
                Some(msg.clone()),
                None,
            ),
            Self::Timeout(_) => (
                StanzaErrorCondition::ResourceConstraint,
                StanzaErrorType::Wait,
                None,
                None,
            ),
            _ => (
                StanzaErrorCondition::InternalServerError,
                StanzaErrorType::Wait,
                None,
                None,
            ),
        };

        let mut error = StanzaError::new(
            error_type.to_error_type(),
            condition.to_defined_condition(),
            "en",
            text.clone().unwrap_or_default(),
        );
        if text.is_none() {
            error.texts.clear();
        }
        error.other = application;
        error
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed XML, etc.)
    BadRequest,
    /// Conflict (e.g., resource already bound)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (permission denied)
    Forbidden,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Policy violation
    PolicyViolation,
    /// Registration required
    RegistrationRequired,
    /// Remote server not found
    RemoteServerNotFound,
    /// Remote server timeout
    RemoteServerTimeout,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Undefined condition
    UndefinedCondition,
    /// Unexpected request
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    fn to_defined_condition(self) -> DefinedCondition {
        match self {
            Self::BadRequest => DefinedCondition::BadRequest,
            Self::Conflict => DefinedCondition::Conflict,
            Self::FeatureNotImplemented => DefinedCondition::FeatureNotImplemented,
            Self::Forbidden => DefinedCondition::Forbidden,
            Self::InternalServerError => DefinedCondition::InternalServerError,
            Self::ItemNotFound => DefinedCondition::ItemNotFound,
            Self::JidMalformed => DefinedCondition::JidMalformed,
            Self::NotAcceptable => DefinedCondition::NotAcceptable,
            Self::NotAllowed => DefinedCondition::NotAllowed,
            Self::NotAuthorized => DefinedCondition::NotAuthorized,
            Self::PolicyViolation => DefinedCondition::PolicyViolation,
            Self::RegistrationRequired => DefinedCondition::RegistrationRequired,
            Self::RemoteServerNotFound => DefinedCondition::RemoteServerNotFound,
            Self::RemoteServerTimeout => DefinedCondition::RemoteServerTimeout,
            Self::ResourceConstraint => DefinedCondition::ResourceConstraint,
            Self::ServiceUnavailable => DefinedCondition::ServiceUnavailable,
            Self::UndefinedCondition => DefinedCondition::UndefinedCondition,
            Self::UnexpectedRequest => DefinedCondition::UnexpectedRequest,
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }

    fn to_error_type(self) -> ErrorType {
        match self {
            Self::Auth => ErrorType::Auth,
            Self::Cancel => ErrorType::Cancel,
            Self::Modify => ErrorType::Modify,
            Self::Wait => ErrorType::Wait,
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Common stream error conditions used when a session is closed by the server.
pub mod stream_errors {
    /// Stream error: conflict (resource already connected)
    pub const CONFLICT: &str = "conflict";
    /// Stream error: policy violation
    pub const POLICY_VIOLATION: &str = "policy-violation";
    /// Stream error: system shutdown
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stanza_error_conditions() {
        assert_eq!(StanzaErrorCondition::BadRequest.as_str(), "bad-request");
        assert_eq!(StanzaErrorCondition::NotAuthorized.as_str(), "not-authorized");
        assert_eq!(StanzaErrorCondition::ItemNotFound.as_str(), "item-not-found");
        assert_eq!(
            StanzaErrorCondition::ResourceConstraint.as_str(),
            "resource-constraint"
        );
    }

    #[test]
    fn test_to_stanza_error_keeps_condition() {
        let error = XmppError::forbidden(Some("not an owner".to_string())).to_stanza_error();
        assert_eq!(error.type_, ErrorType::Auth);
        assert_eq!(error.defined_condition, DefinedCondition::Forbidden);
        assert_eq!(error.texts.values().next().map(String::as_str), Some("not an owner"));
    }

    #[test]
    fn test_internal_errors_become_internal_server_error() {
        let error = XmppError::internal("storage exploded").to_stanza_error();
        assert_eq!(error.defined_condition, DefinedCondition::InternalServerError);
        assert!(error.texts.is_empty());

        let error = XmppError::Canceled.to_stanza_error();
        assert_eq!(error.defined_condition, DefinedCondition::InternalServerError);
    }

    #[test]
    fn test_timeout_maps_to_resource_constraint() {
        let error = XmppError::timeout("queue").to_stanza_error();
        assert_eq!(error.defined_condition, DefinedCondition::ResourceConstraint);
        assert_eq!(error.type_, ErrorType::Wait);
    }

    #[test]
    fn test_application_condition_is_attached() {
        let unsupported = Element::builder("unsupported", "http://jabber.org/protocol/pubsub#errors")
            .attr("feature", "purge-nodes")
            .build();
        let error = XmppError::feature_not_implemented(None)
            .with_application(unsupported)
            .to_stanza_error();

        let other = error.other.expect("application element");
        assert_eq!(other.name(), "unsupported");
        assert_eq!(other.attr("feature"), Some("purge-nodes"));
    }

    #[test]
    fn test_with_application_ignores_internal_errors() {
        let element = Element::builder("x", "urn:test").build();
        let error = XmppError::internal("boom").with_application(element);
        assert!(!error.is_stanza_error());
        assert_eq!(error.condition(), None);
    }
}
