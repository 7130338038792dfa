use std::io;

use crate::models::ErrorKind;

/// Map a failed connect into the reporting taxonomy.
///
/// Pure function of the underlying I/O error; the scheduler records the
/// kind but never branches on it.
pub fn classify_dial_error(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::Timeout,
        io::ErrorKind::ConnectionRefused => ErrorKind::Refused,
        io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::AddrNotAvailable => ErrorKind::Unreachable,
        _ => ErrorKind::Other,
    }
}

/// A dial that ran out its whole timeout without the OS reporting anything.
pub fn dial_timeout_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connect timed out")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_maps_to_refused() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(classify_dial_error(&err), ErrorKind::Refused);
    }

    #[test]
    fn timed_out_maps_to_timeout() {
        assert_eq!(classify_dial_error(&dial_timeout_error()), ErrorKind::Timeout);
    }

    #[test]
    fn unreachable_maps_to_unreachable() {
        let err = io::Error::new(io::ErrorKind::HostUnreachable, "no route");
        assert_eq!(classify_dial_error(&err), ErrorKind::Unreachable);
    }

    #[test]
    fn anything_else_maps_to_other() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(classify_dial_error(&err), ErrorKind::Other);
    }
}
