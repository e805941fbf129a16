//! Deterministic error classification.
//!
//! Classes are derived from error content only: a typed kind when the error
//! carries one, otherwise an ordered table of message patterns. The first
//! matching pattern wins, so more specific classes are listed first.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Failure taxonomy reported to operators.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ErrorClass {
    /// Target reachable by name but the connection failed.
    Connectivity,
    /// Target name could not be resolved.
    NameResolution,
    /// Credentials rejected or missing.
    Authentication,
    /// Remote side ran the probe and it failed.
    RemoteExecution,
    /// Deadline expired.
    Timeout,
    /// Local or remote resources ran out.
    ResourceExhaustion,
    /// Collected data was malformed.
    DataValidation,
    /// Nothing else matched.
    Unclassified,
}

impl ErrorClass {
    /// Transient classes are eligible for retry; everything else is terminal.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Connectivity | Self::NameResolution | Self::Timeout
        )
    }

    /// Operator-facing severity, higher is worse.
    ///
    /// Classes that usually indicate a fleet-wide misconfiguration rank above
    /// classes that usually indicate a single flaky host.
    pub fn severity(self) -> u8 {
        match self {
            Self::ResourceExhaustion => 7,
            Self::Authentication => 6,
            Self::RemoteExecution => 5,
            Self::DataValidation => 4,
            Self::NameResolution => 3,
            Self::Connectivity => 2,
            Self::Timeout => 1,
            Self::Unclassified => 0,
        }
    }

    /// Classify free-form error text.
    pub fn from_message(message: &str) -> Self {
        patterns()
            .iter()
            .find(|(_, re)| re.is_match(message))
            .map(|(class, _)| *class)
            .unwrap_or(Self::Unclassified)
    }

    /// Classify an I/O error, falling back to its message for generic kinds.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::AddrNotAvailable
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
            | ErrorKind::NetworkDown => Self::Connectivity,
            ErrorKind::TimedOut => Self::Timeout,
            ErrorKind::PermissionDenied => Self::Authentication,
            ErrorKind::InvalidData | ErrorKind::UnexpectedEof => Self::DataValidation,
            ErrorKind::OutOfMemory | ErrorKind::StorageFull | ErrorKind::QuotaExceeded => {
                Self::ResourceExhaustion
            }
            _ => Self::from_message(&err.to_string()),
        }
    }
}

/// Errors that can report their own class.
pub trait Classify {
    /// Class of this error. Must be a pure function of the error's content.
    fn error_class(&self) -> ErrorClass;
}

impl Classify for std::io::Error {
    fn error_class(&self) -> ErrorClass {
        ErrorClass::from_io(self)
    }
}

fn patterns() -> &'static [(ErrorClass, Regex)] {
    static PATTERNS: OnceLock<Vec<(ErrorClass, Regex)>> = OnceLock::new();

    PATTERNS.get_or_init(|| {
        [
            (
                ErrorClass::NameResolution,
                r"(?i)name or service not known|failed to lookup address|no such host|nxdomain|could not resolve|name resolution|temporary failure in name|no address associated",
            ),
            (
                ErrorClass::Authentication,
                r"(?i)authenticat|permission denied|access denied|access is denied|unauthori[sz]ed|forbidden|invalid credentials|logon failure|publickey|bad password",
            ),
            (
                ErrorClass::Timeout,
                r"(?i)timed? ?out|deadline (exceeded|elapsed)|timeout elapsed",
            ),
            (
                ErrorClass::ResourceExhaustion,
                r"(?i)out of memory|no space left|too many open files|resource temporarily unavailable|quota exceeded|exhausted|cannot allocate",
            ),
            (
                ErrorClass::Connectivity,
                r"(?i)connection (refused|reset|aborted|closed)|unreachable|broken pipe|no route to host|network is down|not connected|host is down|connect failed",
            ),
            (
                ErrorClass::DataValidation,
                r"(?i)invalid (data|json|format|utf-?8|payload)|malformed|unexpected (token|eof|end of)|schema|deserializ|parse error|failed to parse",
            ),
            (
                ErrorClass::RemoteExecution,
                r"(?i)exit (code|status)|command failed|non-zero|remote (error|command|execution)|rpc (error|failure)|script error",
            ),
        ]
        .into_iter()
        .map(|(class, pattern)| {
            (
                class,
                Regex::new(pattern).expect("failed to compile classification pattern"),
            )
        })
        .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_from_message_table() {
        let cases = [
            (
                "failed to lookup address information: Name or service not known",
                ErrorClass::NameResolution,
            ),
            ("Permission denied (publickey)", ErrorClass::Authentication),
            ("connection timed out", ErrorClass::Timeout),
            ("Connection refused (os error 111)", ErrorClass::Connectivity),
            ("No route to host", ErrorClass::Connectivity),
            ("No space left on device", ErrorClass::ResourceExhaustion),
            ("failed to parse inventory payload", ErrorClass::DataValidation),
            ("remote command failed with exit code 3", ErrorClass::RemoteExecution),
            ("something odd happened", ErrorClass::Unclassified),
        ];
        for (message, expected) in cases {
            assert_eq!(ErrorClass::from_message(message), expected, "{message}");
        }
    }

    #[test]
    fn test_from_message_is_deterministic() {
        let msg = "Connection reset by peer";
        let first = ErrorClass::from_message(msg);
        for _ in 0..10 {
            assert_eq!(ErrorClass::from_message(msg), first);
        }
    }

    #[test]
    fn test_from_io_kinds() {
        assert_eq!(
            ErrorClass::from_io(&Error::from(ErrorKind::ConnectionRefused)),
            ErrorClass::Connectivity
        );
        assert_eq!(
            ErrorClass::from_io(&Error::from(ErrorKind::TimedOut)),
            ErrorClass::Timeout
        );
        assert_eq!(
            ErrorClass::from_io(&Error::from(ErrorKind::PermissionDenied)),
            ErrorClass::Authentication
        );
        // Generic kinds fall back to the message.
        assert_eq!(
            ErrorClass::from_io(&Error::other("no such host")),
            ErrorClass::NameResolution
        );
    }

    #[test]
    fn test_transient_classes() {
        let transient: Vec<_> = ErrorClass::iter().filter(|c| c.is_transient()).collect();
        assert_eq!(
            transient,
            vec![
                ErrorClass::Connectivity,
                ErrorClass::NameResolution,
                ErrorClass::Timeout
            ]
        );
    }

    #[test]
    fn test_error_class_strings() {
        assert_eq!(ErrorClass::NameResolution.as_ref(), "name_resolution");
        assert_eq!(
            ErrorClass::from_str("RESOURCE_EXHAUSTION").unwrap(),
            ErrorClass::ResourceExhaustion
        );
        assert!(ErrorClass::from_str("fatal").is_err());
    }
}
