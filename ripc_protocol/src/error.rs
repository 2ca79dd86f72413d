use std::sync::PoisonError;

use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

use crate::Identity;

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, Hash, EnumIter, EnumString)]
pub enum ErrorKind {
    // resolution
    NoEndpoints,
    NotRegistered,
    // connection
    ConnectFailed,
    ConnectTimeout,
    ConnectionLost,
    CloseConnection,
    ConnectionManuallyClosed,
    // protocol
    Marshal,
    UnsupportedFeature,
    UnsupportedVersion,
    // policy
    TwowayOnly,
    FixedProxy,
    UnsupportedOperation,
    InvalidArgument,
    // lifecycle
    CommunicatorDestroyed,
    ObjectAdapterDeactivated,
    // cancellation
    InvocationTimeout,
    InvocationCanceled,
    // request failed
    ObjectNotExist,
    FacetNotExist,
    OperationNotExist,
    Unknown,
    Other,
}

/// Coarse grouping of [`ErrorKind`]s used by the retry policy.
#[derive(Debug, Copy, Clone, Display, PartialEq, Eq)]
pub enum ErrorCategory {
    Resolution,
    Connection,
    Protocol,
    Policy,
    Lifecycle,
    Cancellation,
    RequestFailed,
    Unknown,
}

impl ErrorKind {
    pub fn category(self) -> ErrorCategory {
        use ErrorKind::*;
        match self {
            NoEndpoints | NotRegistered => ErrorCategory::Resolution,
            ConnectFailed | ConnectTimeout | ConnectionLost | CloseConnection
            | ConnectionManuallyClosed => ErrorCategory::Connection,
            Marshal | UnsupportedFeature | UnsupportedVersion => ErrorCategory::Protocol,
            TwowayOnly | FixedProxy | UnsupportedOperation | InvalidArgument => {
                ErrorCategory::Policy
            }
            CommunicatorDestroyed | ObjectAdapterDeactivated => ErrorCategory::Lifecycle,
            InvocationTimeout | InvocationCanceled => ErrorCategory::Cancellation,
            ObjectNotExist | FacetNotExist | OperationNotExist => ErrorCategory::RequestFailed,
            Unknown | Other => ErrorCategory::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}{}", detail(.msg))]
pub struct Error {
    kind: ErrorKind,
    msg: String,
    operation: Option<String>,
}

fn detail(msg: &str) -> String {
    if msg.is_empty() {
        String::new()
    } else {
        format!(": {}", msg)
    }
}

impl Error {
    pub fn new<S: Into<String>>(kind: ErrorKind, msg: S) -> Self {
        Error {
            kind,
            msg: msg.into(),
            operation: None,
        }
    }

    /// Attaches the name of the operation the error was raised for.
    pub fn with_operation<S: Into<String>>(mut self, operation: S) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn no_endpoints<S: Into<String>>(proxy: S) -> Self {
        Error::new(ErrorKind::NoEndpoints, proxy)
    }

    /// `kind_of_object` is either `"object"` or `"object adapter"`.
    pub fn not_registered(kind_of_object: &str, id: &str) -> Self {
        Error::new(
            ErrorKind::NotRegistered,
            format!("no {} with id `{}' is registered", kind_of_object, id),
        )
    }

    pub fn object_not_exist(identity: &Identity, facet: &str, operation: &str) -> Self {
        let msg = if facet.is_empty() {
            format!("object `{}' does not exist", identity)
        } else {
            format!("object `{}' with facet `{}' does not exist", identity, facet)
        };
        Error::new(ErrorKind::ObjectNotExist, msg).with_operation(operation)
    }

    pub fn is_request_failed(&self) -> bool {
        self.category() == ErrorCategory::RequestFailed
    }

    /// A close notification from the peer: nothing of the request was
    /// processed, so it can always be sent again.
    pub fn is_graceful_close(&self) -> bool {
        self.kind == ErrorKind::CloseConnection
    }

    pub fn is_cancellation(&self) -> bool {
        self.category() == ErrorCategory::Cancellation
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind, String::new())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Marshal, err.to_string())
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Self {
        Error::new(ErrorKind::Other, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn display_with_and_without_message() {
        let err: Error = ErrorKind::InvocationTimeout.into();
        assert_eq!(err.to_string(), "InvocationTimeout");

        let err = Error::new(ErrorKind::ConnectFailed, "connection refused");
        assert_eq!(err.to_string(), "ConnectFailed: connection refused");
    }

    #[test]
    fn kinds_parse_back_from_their_names() {
        for kind in ErrorKind::iter() {
            assert_eq!(ErrorKind::from_str(&kind.to_string()).unwrap(), kind);
        }
    }

    #[test]
    fn categories() {
        assert_eq!(ErrorKind::NotRegistered.category(), ErrorCategory::Resolution);
        assert_eq!(ErrorKind::CloseConnection.category(), ErrorCategory::Connection);
        assert_eq!(ErrorKind::Marshal.category(), ErrorCategory::Protocol);
        assert_eq!(ErrorKind::FixedProxy.category(), ErrorCategory::Policy);
        assert_eq!(
            ErrorKind::ObjectAdapterDeactivated.category(),
            ErrorCategory::Lifecycle
        );
        assert!(Error::from(ErrorKind::InvocationCanceled).is_cancellation());
    }

    #[test]
    fn object_not_exist_keeps_operation() {
        let id = Identity::new("hello", "");
        let err = Error::object_not_exist(&id, "", "ice_add_proxy");
        assert!(err.is_request_failed());
        assert_eq!(err.operation(), Some("ice_add_proxy"));
        assert_eq!(err.message(), "object `hello' does not exist");
    }
}
