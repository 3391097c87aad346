use std::error;
use std::fmt;
use std::io;
use std::str;

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The server generated an invalid response.
    ProtocolError,
    /// The underlying transport is gone. Depending on offline-queue semantics
    /// the affected command may be retried transparently.
    ConnectionClosed,
    /// A caller-supplied deadline expired. Carries no guarantee about whether
    /// the server executed the command.
    Timeout,
    /// An authentication step of the handshake was rejected.
    AuthenticationFailed,
    /// The server returned an error reply for this command.
    ResponseError,
    /// A response of unexpected shape was received for the requested type.
    TypeError,
    /// A transaction was aborted by the server before execution.
    ExecAbort,
    /// The server is busy loading its dataset and cannot serve yet.
    BusyLoading,
    /// The command's keys hash to more than one cluster slot.
    CrossSlot,
    /// Permanent redirection: the slot moved to another node.
    Moved,
    /// Advisory redirection: ask another node for this one command.
    Ask,
    /// The slot is mid-migration; the command may be retried shortly.
    TryAgain,
    /// The cluster is down, or the redirect ceiling was exhausted.
    ClusterDown,
    /// A sentinel-driven failover invalidated an in-flight command.
    MasterChanged,
    /// No configured sentinel answered an address-resolution query.
    NoSentinelsAvailable,
    /// A command was rejected because a queue limit was reached.
    QueueFull,
    /// The read-only replica refused a write.
    ReadOnly,
    /// The client configuration is invalid.
    InvalidClientConfig,
    /// An error raised by the client library itself.
    ClientError,
    /// Any IO error not covered above.
    Io,
    /// An extension error code not known to this client.
    Extension,
}

#[derive(Debug)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    ExtensionError(String, String),
    IoError(io::Error),
}

/// Represents a wire-protocol client error. For the most part you should be
/// using the Error trait to interact with this rather than the actual struct.
pub struct Error {
    repr: ErrorRepr,
}

/// Library generic result type.
pub type RedioxResult<T> = Result<T, Error>;

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        match (&self.repr, &other.repr) {
            (&ErrorRepr::WithDescription(kind_a, _), &ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                &ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                &ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::ExtensionError(a, _), ErrorRepr::ExtensionError(b, _)) => *a == *b,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error {
            repr: ErrorRepr::IoError(err),
        }
    }
}

impl From<str::Utf8Error> for Error {
    fn from(_: str::Utf8Error) -> Error {
        Error {
            repr: ErrorRepr::WithDescription(ErrorKind::TypeError, "invalid UTF-8"),
        }
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_: std::string::FromUtf8Error) -> Error {
        Error {
            repr: ErrorRepr::WithDescription(ErrorKind::TypeError, "invalid UTF-8"),
        }
    }
}

impl From<(ErrorKind, &'static str)> for Error {
    fn from((kind, desc): (ErrorKind, &'static str)) -> Error {
        Error {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for Error {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> Error {
        Error {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self.repr {
            ErrorRepr::IoError(ref err) => Some(err as &dyn error::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                desc.fmt(f)?;
                f.write_str("- ")?;
                fmt::Debug::fmt(&kind, f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::ExtensionError(ref code, ref detail) => {
                code.fmt(f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::IoError(ref err) => err.fmt(f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Error {
    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::ExtensionError(_, _) => ErrorKind::Extension,
            ErrorRepr::IoError(_) => ErrorKind::Io,
        }
    }

    /// Returns the error detail, if any.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail)
            | ErrorRepr::ExtensionError(_, ref detail) => Some(detail.as_str()),
            _ => None,
        }
    }

    /// Returns the raw error code of a server error reply, if any.
    pub fn code(&self) -> Option<&str> {
        match self.kind() {
            ErrorKind::ResponseError => Some("ERR"),
            ErrorKind::ExecAbort => Some("EXECABORT"),
            ErrorKind::BusyLoading => Some("LOADING"),
            ErrorKind::CrossSlot => Some("CROSSSLOT"),
            ErrorKind::Moved => Some("MOVED"),
            ErrorKind::Ask => Some("ASK"),
            ErrorKind::TryAgain => Some("TRYAGAIN"),
            ErrorKind::ClusterDown => Some("CLUSTERDOWN"),
            ErrorKind::ReadOnly => Some("READONLY"),
            ErrorKind::AuthenticationFailed => Some("NOAUTH"),
            _ => match self.repr {
                ErrorRepr::ExtensionError(ref code, _) => Some(code),
                _ => None,
            },
        }
    }

    /// True when the error originated from a server error reply, i.e. the
    /// server acknowledged the command and refused it. Such errors are never
    /// retried automatically.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ResponseError
                | ErrorKind::ExecAbort
                | ErrorKind::BusyLoading
                | ErrorKind::Moved
                | ErrorKind::Ask
                | ErrorKind::TryAgain
                | ErrorKind::ClusterDown
                | ErrorKind::CrossSlot
                | ErrorKind::ReadOnly
                | ErrorKind::AuthenticationFailed
                | ErrorKind::Extension
        )
    }

    /// True when the underlying transport was lost before a reply arrived.
    pub fn is_connection_dropped(&self) -> bool {
        match self.repr {
            ErrorRepr::IoError(ref err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => self.kind() == ErrorKind::ConnectionClosed,
        }
    }

    /// True when this error indicates stale cluster routing state that a
    /// topology refresh may fix.
    pub fn is_cluster_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Moved | ErrorKind::Ask | ErrorKind::TryAgain | ErrorKind::ClusterDown
        )
    }

    /// True for errors that no amount of retrying will fix on this
    /// connection.
    pub fn is_unrecoverable_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProtocolError | ErrorKind::InvalidClientConfig
        )
    }

    /// For `MOVED` and `ASK` errors, returns the `(host, port)` the server
    /// redirected us to.
    pub fn redirect_node(&self) -> Option<(&str, u16)> {
        match self.kind() {
            ErrorKind::Ask | ErrorKind::Moved => (),
            _ => return None,
        }
        let mut iter = self.detail()?.split_ascii_whitespace();
        let _slot = iter.next()?;
        let addr = iter.next()?;
        let (host, port) = addr.rsplit_once(':')?;
        Some((host, port.parse().ok()?))
    }

    /// For `MOVED` and `ASK` errors, returns the slot the redirection is
    /// about.
    pub fn redirect_slot(&self) -> Option<u16> {
        match self.kind() {
            ErrorKind::Ask | ErrorKind::Moved => (),
            _ => return None,
        }
        self.detail()?.split_ascii_whitespace().next()?.parse().ok()
    }
}

/// Builds an [`Error`] from the code and message of a server error reply.
///
/// Well-known codes map to their dedicated [`ErrorKind`]; everything else is
/// carried verbatim as an extension error.
pub fn make_server_error(code: &str, detail: &str) -> Error {
    let kind = match code {
        "ERR" => ErrorKind::ResponseError,
        "EXECABORT" => ErrorKind::ExecAbort,
        "LOADING" => ErrorKind::BusyLoading,
        "MOVED" => ErrorKind::Moved,
        "ASK" => ErrorKind::Ask,
        "TRYAGAIN" => ErrorKind::TryAgain,
        "CLUSTERDOWN" => ErrorKind::ClusterDown,
        "CROSSSLOT" => ErrorKind::CrossSlot,
        "MASTERDOWN" => ErrorKind::ClusterDown,
        "READONLY" => ErrorKind::ReadOnly,
        "NOAUTH" | "WRONGPASS" | "NOPERM" => ErrorKind::AuthenticationFailed,
        _ => {
            return Error {
                repr: ErrorRepr::ExtensionError(code.to_string(), detail.to_string()),
            }
        }
    };
    Error::from((kind, "An error was signalled by the server", detail.to_string()))
}

pub(crate) fn closed_connection_error() -> Error {
    Error::from((
        ErrorKind::ConnectionClosed,
        "Connection closed before the reply was received",
    ))
}

pub(crate) fn timeout_error() -> Error {
    Error::from((
        ErrorKind::Timeout,
        "Deadline exceeded while waiting for the reply",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_codes_map_to_kinds() {
        assert_eq!(make_server_error("ERR", "oops").kind(), ErrorKind::ResponseError);
        assert_eq!(make_server_error("LOADING", "x").kind(), ErrorKind::BusyLoading);
        assert_eq!(make_server_error("MOVED", "1 a:1").kind(), ErrorKind::Moved);
        let ext = make_server_error("WOBBLY", "unknown");
        assert_eq!(ext.kind(), ErrorKind::Extension);
        assert_eq!(ext.code(), Some("WOBBLY"));
    }

    #[test]
    fn redirect_node_is_parsed_from_moved() {
        let err = make_server_error("MOVED", "3999 127.0.0.1:6381");
        assert_eq!(err.redirect_node(), Some(("127.0.0.1", 6381)));
        assert_eq!(err.redirect_slot(), Some(3999));

        let err = make_server_error("ASK", "42 [::1]:7000");
        assert_eq!(err.redirect_node(), Some(("[::1]", 7000)));
        assert_eq!(err.redirect_slot(), Some(42));
    }

    #[test]
    fn plain_errors_have_no_redirect() {
        let err = make_server_error("ERR", "3999 127.0.0.1:6381");
        assert_eq!(err.redirect_node(), None);
    }

    #[test]
    fn connection_dropped_detection() {
        let err = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(err.is_connection_dropped());
        assert!(closed_connection_error().is_connection_dropped());
        assert!(!timeout_error().is_connection_dropped());
    }
}
