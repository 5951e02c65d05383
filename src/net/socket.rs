//! Socket option helpers not exposed directly by `mio`/`std`.

use std::os::fd::RawFd;

/// Turns `SO_KEEPALIVE` on or off. Applied unconditionally to every accepted
/// connection at construction time.
pub(crate) fn set_keepalive(fd: RawFd, enable: bool) -> std::io::Result<()> {
    let value: libc::c_int = enable as libc::c_int;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_KEEPALIVE,
        &value as *const libc::c_int as *const libc::c_void,
        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;
    Ok(())
}
