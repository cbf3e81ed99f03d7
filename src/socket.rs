use std::io;
use std::mem::{self, size_of, MaybeUninit};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::error;

/// An owned TCP socket descriptor.
///
/// Closing is automatic on drop. Every socket this crate creates is
/// non-blocking and close-on-exec from birth (`SOCK_NONBLOCK | SOCK_CLOEXEC`
/// at `socket(2)`/`accept4(2)` time), so no fcntl dance is ever needed.
pub(crate) struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a non-blocking stream socket for `addr`'s address family.
    pub(crate) fn new_stream(addr: &SocketAddr) -> io::Result<Socket> {
        let domain = match addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };
        let fd = syscall!(socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        ))?;
        // SAFETY: `socket(2)` returned a valid, owned fd.
        Ok(Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (raw, len) = socket_addr(addr);
        syscall!(bind(self.fd(), raw.as_ptr(), len)).map(|_| ())
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd(), 1024)).map(|_| ())
    }

    /// Accepts one pending connection, non-blocking and close-on-exec.
    pub(crate) fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        // SAFETY: `accept4(2)` returned a valid fd and initialised the
        // address storage.
        let socket = Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };
        let addr = unsafe { to_socket_addr(storage.as_ptr())? };
        Ok((socket, addr))
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            self.fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
        ))?;
        // SAFETY: `getsockname(2)` initialised the address storage.
        unsafe { to_socket_addr(storage.as_ptr()) }
    }

    /// Half-closes the write side, flushing an EOF to the peer once the
    /// kernel send queue drains.
    pub(crate) fn shutdown_write(&self) {
        if let Err(err) = syscall!(shutdown(self.fd(), libc::SHUT_WR)) {
            error!("shutdown(SHUT_WR) on fd = {}: {}", self.fd(), err);
        }
    }

    /// Reads and clears the socket's pending error.
    pub(crate) fn take_error(&self) -> i32 {
        let mut optval: libc::c_int = 0;
        let mut optlen = size_of::<libc::c_int>() as libc::socklen_t;
        match syscall!(getsockopt(
            self.fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut libc::c_int as *mut libc::c_void,
            &mut optlen,
        )) {
            Ok(_) => optval,
            Err(err) => err.raw_os_error().unwrap_or(0),
        }
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.set_bool_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_bool_option(libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub(crate) fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.set_bool_option(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    pub(crate) fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.set_bool_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    fn set_bool_option(&self, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
        let optval: libc::c_int = i32::from(on);
        syscall!(setsockopt(
            self.fd(),
            level,
            opt,
            &optval as *const libc::c_int as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }
}

/// A `sockaddr_in` or `sockaddr_in6`, whichever the address requires.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const SocketAddrCRepr as *const libc::sockaddr
    }
}

/// Converts a `SocketAddr` into its C representation for `bind(2)` etc.
pub(crate) fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(addr) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            (
                SocketAddrCRepr { v4: sin },
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(addr) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_flowinfo: addr.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_scope_id: addr.scope_id(),
            };
            (
                SocketAddrCRepr { v6: sin6 },
                size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// Reads a `SocketAddr` back out of kernel-filled address storage.
///
/// # Safety
///
/// `storage` must point to a `sockaddr_storage` initialised by the kernel
/// with an `AF_INET` or `AF_INET6` address.
pub(crate) unsafe fn to_socket_addr(
    storage: *const libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let sin: libc::sockaddr_in = mem::transmute_copy(&*storage);
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6: libc::sockaddr_in6 = mem::transmute_copy(&*storage);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}
