//! Byte-stream building blocks underneath the TLS layer.

use std::io;

pub(crate) mod paced;
pub(crate) mod tls;

/// OS-level check that the peer has not closed the connection.
///
/// Peeks one byte without consuming it: pending data (even a close_notify
/// record) counts as open, a clean FIN counts as closed, and any error
/// other than would-block counts as closed.
#[cfg(unix)]
pub(crate) fn socket_not_closed_by_peer(fd: std::os::fd::RawFd) -> bool {
    let mut byte = 0u8;
    #[allow(unsafe_code)]
    // Safety: MSG_PEEK|MSG_DONTWAIT reads at most one byte into `byte`
    // without consuming it; the fd is owned by the calling socket wrapper.
    let n = unsafe {
        libc::recv(
            fd,
            std::ptr::from_mut(&mut byte).cast(),
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };

    match n {
        n if n > 0 => true,
        0 => false,
        _ => io::Error::last_os_error().kind() == io::ErrorKind::WouldBlock,
    }
}
