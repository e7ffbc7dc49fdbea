use std::{borrow::Cow, io, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Normalize a bind/listen address.
///
/// Configs commonly use the shorthand `":PORT"` to mean "bind on all interfaces".
/// Tokio bind APIs do not accept `":PORT"`, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Errors after which a local connect is worth retrying: the service is not up yet,
/// or it dropped us mid-handshake.
pub fn is_transient_connect_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

/// Relay bytes in both directions until both sides finished or one errored.
///
/// Returns `(a_to_b, b_to_a)` byte counts. Errors end the relay silently; callers only
/// care that the splice is over.
pub async fn splice<A, B>(a: &mut A, b: &mut B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    match tokio::io::copy_bidirectional(a, b).await {
        Ok(counts) => counts,
        Err(err) => {
            tracing::debug!(err = %err, "splice: ended with error");
            let _ = a.shutdown().await;
            let _ = b.shutdown().await;
            (0, 0)
        }
    }
}

// EMFILE and ENFILE share these values on Linux and the BSDs.
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;

/// How long a listener backs off after a failed `accept()`.
///
/// Descriptor exhaustion clears only when connections close, so it waits longer.
pub fn accept_error_delay(err: &io::Error) -> Duration {
    match err.raw_os_error() {
        Some(EMFILE) | Some(ENFILE) => Duration::from_millis(100),
        _ => Duration::from_millis(5),
    }
}

/// Log and count a failed `accept()`, then back off. The listener keeps serving.
pub async fn pause_after_accept_error(listener: &'static str, err: &io::Error) {
    metrics::counter!("backhaul_accept_errors_total", "listener" => listener).increment(1);
    tracing::warn!(listener, err = %err, "accept failed; retrying");
    tokio::time::sleep(accept_error_delay(err)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn transient_errors_are_refused_and_reset_only() {
        assert!(is_transient_connect_error(&io::Error::from(
            io::ErrorKind::ConnectionRefused
        )));
        assert!(is_transient_connect_error(&io::Error::from(
            io::ErrorKind::ConnectionReset
        )));
        assert!(!is_transient_connect_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        assert!(!is_transient_connect_error(&io::Error::from(
            io::ErrorKind::InvalidData
        )));
    }

    #[test]
    fn descriptor_exhaustion_backs_off_longer() {
        let emfile = io::Error::from_raw_os_error(EMFILE);
        let enfile = io::Error::from_raw_os_error(ENFILE);
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(accept_error_delay(&emfile), Duration::from_millis(100));
        assert_eq!(accept_error_delay(&enfile), Duration::from_millis(100));
        assert_eq!(accept_error_delay(&aborted), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn accept_error_pause_returns_after_the_delay() {
        let err = io::Error::from_raw_os_error(EMFILE);
        let start = tokio::time::Instant::now();
        pause_after_accept_error("test", &err).await;
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }
}
