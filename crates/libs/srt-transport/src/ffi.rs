//! Native libsrt binding
//!
//! Raw declarations for the part of `srt.h` the bridge uses, plus [`LibSrt`],
//! the [`SrtApi`] implementation on top of them.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use crate::api::{ConnectionState, PollId, SocketId, SrtApi, TransportError};

const SRT_INVALID_SOCK: c_int = -1;
const SRT_ERROR: c_int = -1;

// SRT_SOCKOPT
const SRTO_SNDSYN: c_int = 1;
const SRTO_RCVSYN: c_int = 2;
const SRTO_RCVTIMEO: c_int = 14;
const SRTO_LATENCY: c_int = 23;

// SRT_EPOLL_OPT
const SRT_EPOLL_IN: c_int = 0x1;
const SRT_EPOLL_ERR: c_int = 0x8;

// SRT_ERRNO
const SRT_ECONNLOST: c_int = 2001;
const SRT_ENOCONN: c_int = 2002;
const SRT_EASYNCSND: c_int = 6001;
const SRT_EASYNCRCV: c_int = 6002;
const SRT_ETIMEOUT: c_int = 6003;

// syslog levels understood by srt_setloglevel
const LOG_ERR: c_int = 3;
const LOG_WARNING: c_int = 4;
const LOG_NOTICE: c_int = 5;

const AF_INET: u16 = 2;

/// `struct sockaddr_in`
#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrIn {
    sin_family: u16,
    sin_port: u16,
    sin_addr: u32,
    sin_zero: [u8; 8],
}

/// `struct sockaddr_in` (BSD layout with the length byte)
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrIn {
    sin_len: u8,
    sin_family: u8,
    sin_port: u16,
    sin_addr: u32,
    sin_zero: [u8; 8],
}

impl SockaddrIn {
    #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
    fn from_addr(addr: SocketAddrV4) -> Self {
        Self {
            sin_family: AF_INET,
            sin_port: addr.port().to_be(),
            sin_addr: u32::from(*addr.ip()).to_be(),
            sin_zero: [0; 8],
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    fn from_addr(addr: SocketAddrV4) -> Self {
        Self {
            sin_len: std::mem::size_of::<SockaddrIn>() as u8,
            sin_family: AF_INET as u8,
            sin_port: addr.port().to_be(),
            sin_addr: u32::from(*addr.ip()).to_be(),
            sin_zero: [0; 8],
        }
    }

    fn to_addr(self) -> SocketAddrV4 {
        SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(self.sin_addr)),
            u16::from_be(self.sin_port),
        )
    }
}

type LogHandler = extern "C" fn(
    opaque: *mut c_void,
    level: c_int,
    file: *const c_char,
    line: c_int,
    area: *const c_char,
    message: *const c_char,
);

#[link(name = "srt")]
extern "C" {
    fn srt_startup() -> c_int;
    fn srt_cleanup() -> c_int;

    fn srt_create_socket() -> c_int;
    fn srt_close(sock: c_int) -> c_int;
    fn srt_getsockstate(sock: c_int) -> c_int;
    fn srt_setsockflag(sock: c_int, opt: c_int, optval: *const c_void, optlen: c_int) -> c_int;

    fn srt_bind(sock: c_int, name: *const c_void, namelen: c_int) -> c_int;
    fn srt_listen(sock: c_int, backlog: c_int) -> c_int;
    fn srt_accept(sock: c_int, addr: *mut c_void, addrlen: *mut c_int) -> c_int;
    fn srt_connect(sock: c_int, name: *const c_void, namelen: c_int) -> c_int;

    fn srt_send(sock: c_int, buf: *const c_char, len: c_int) -> c_int;
    fn srt_recvmsg(sock: c_int, buf: *mut c_char, len: c_int) -> c_int;

    fn srt_epoll_create() -> c_int;
    fn srt_epoll_add_usock(eid: c_int, sock: c_int, events: *const c_int) -> c_int;
    fn srt_epoll_remove_usock(eid: c_int, sock: c_int) -> c_int;
    #[allow(clippy::too_many_arguments)]
    fn srt_epoll_wait(
        eid: c_int,
        readfds: *mut c_int,
        rnum: *mut c_int,
        writefds: *mut c_int,
        wnum: *mut c_int,
        ms_timeout: i64,
        lrfds: *mut c_int,
        lrnum: *mut c_int,
        lwfds: *mut c_int,
        lwnum: *mut c_int,
    ) -> c_int;
    fn srt_epoll_release(eid: c_int) -> c_int;

    fn srt_getlasterror(errno_loc: *mut c_int) -> c_int;
    fn srt_getlasterror_str() -> *const c_char;
    fn srt_clearlasterror();

    fn srt_setloghandler(opaque: *mut c_void, handler: Option<LogHandler>);
    fn srt_setloglevel(level: c_int);
}

fn last_error() -> TransportError {
    let code = unsafe { srt_getlasterror(std::ptr::null_mut()) };
    match code {
        SRT_EASYNCSND | SRT_EASYNCRCV => TransportError::WouldBlock,
        SRT_ETIMEOUT => TransportError::TimedOut,
        SRT_ECONNLOST | SRT_ENOCONN => TransportError::ConnectionLost,
        _ => TransportError::Other {
            code,
            message: last_error_str(),
        },
    }
}

fn last_error_str() -> String {
    unsafe {
        let ptr = srt_getlasterror_str();
        if ptr.is_null() {
            "Unknown error".to_string()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

fn check(result: c_int) -> Result<(), TransportError> {
    if result == SRT_ERROR {
        Err(last_error())
    } else {
        Ok(())
    }
}

fn set_flag(sock: SocketId, opt: c_int, value: c_int) -> Result<(), TransportError> {
    let result = unsafe {
        srt_setsockflag(
            sock,
            opt,
            &value as *const c_int as *const c_void,
            std::mem::size_of::<c_int>() as c_int,
        )
    };
    check(result)
}

unsafe fn lossy(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

extern "C" fn forward_log(
    _opaque: *mut c_void,
    level: c_int,
    file: *const c_char,
    line: c_int,
    area: *const c_char,
    message: *const c_char,
) {
    let (file, area, message) = unsafe { (lossy(file), lossy(area), lossy(message)) };
    let message = message.trim_end();
    match level {
        l if l <= LOG_ERR => tracing::error!(target: "libsrt", %area, %file, line, "{}", message),
        LOG_WARNING => tracing::warn!(target: "libsrt", %area, %file, line, "{}", message),
        _ => tracing::debug!(target: "libsrt", %area, %file, line, "{}", message),
    }
}

/// [`SrtApi`] backed by the native libsrt
#[derive(Debug, Default)]
pub struct LibSrt;

impl LibSrt {
    pub fn new() -> Self {
        Self
    }
}

impl SrtApi for LibSrt {
    fn startup(&self) -> Result<(), TransportError> {
        // srt_startup returns 1 when the library was already running
        let result = unsafe { srt_startup() };
        if result < 0 {
            return Err(last_error());
        }
        unsafe {
            srt_setloghandler(std::ptr::null_mut(), Some(forward_log));
            srt_setloglevel(LOG_NOTICE);
        }
        Ok(())
    }

    fn cleanup(&self) {
        unsafe {
            srt_setloghandler(std::ptr::null_mut(), None);
            srt_cleanup();
        }
    }

    fn create_socket(&self) -> Result<SocketId, TransportError> {
        let sock = unsafe { srt_create_socket() };
        if sock == SRT_INVALID_SOCK {
            Err(last_error())
        } else {
            Ok(sock)
        }
    }

    fn close(&self, sock: SocketId) {
        unsafe {
            srt_close(sock);
        }
    }

    fn state(&self, sock: SocketId) -> ConnectionState {
        match unsafe { srt_getsockstate(sock) } {
            1 => ConnectionState::Init,
            2 => ConnectionState::Opened,
            3 => ConnectionState::Listening,
            4 => ConnectionState::Connecting,
            5 => ConnectionState::Connected,
            6 => ConnectionState::Broken,
            7 => ConnectionState::Closing,
            8 => ConnectionState::Closed,
            _ => ConnectionState::NonExistent,
        }
    }

    fn set_send_blocking(&self, sock: SocketId, blocking: bool) -> Result<(), TransportError> {
        set_flag(sock, SRTO_SNDSYN, blocking as c_int)
    }

    fn set_recv_blocking(&self, sock: SocketId, blocking: bool) -> Result<(), TransportError> {
        set_flag(sock, SRTO_RCVSYN, blocking as c_int)
    }

    fn set_recv_timeout(&self, sock: SocketId, timeout: Duration) -> Result<(), TransportError> {
        let ms = timeout.as_millis().min(c_int::MAX as u128) as c_int;
        set_flag(sock, SRTO_RCVTIMEO, ms)
    }

    fn set_latency(&self, sock: SocketId, latency_ms: u32) -> Result<(), TransportError> {
        set_flag(sock, SRTO_LATENCY, latency_ms.min(c_int::MAX as u32) as c_int)
    }

    fn connect(&self, sock: SocketId, addr: SocketAddrV4) -> Result<(), TransportError> {
        let name = SockaddrIn::from_addr(addr);
        let result = unsafe {
            srt_connect(
                sock,
                &name as *const SockaddrIn as *const c_void,
                std::mem::size_of::<SockaddrIn>() as c_int,
            )
        };
        check(result)
    }

    fn bind(&self, sock: SocketId, addr: SocketAddrV4) -> Result<(), TransportError> {
        let name = SockaddrIn::from_addr(addr);
        let result = unsafe {
            srt_bind(
                sock,
                &name as *const SockaddrIn as *const c_void,
                std::mem::size_of::<SockaddrIn>() as c_int,
            )
        };
        check(result)
    }

    fn listen(&self, sock: SocketId, backlog: i32) -> Result<(), TransportError> {
        check(unsafe { srt_listen(sock, backlog) })
    }

    fn accept(&self, sock: SocketId) -> Result<(SocketId, SocketAddrV4), TransportError> {
        let mut peer = SockaddrIn::from_addr(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        let mut len = std::mem::size_of::<SockaddrIn>() as c_int;
        let client = unsafe {
            srt_accept(
                sock,
                &mut peer as *mut SockaddrIn as *mut c_void,
                &mut len,
            )
        };
        if client == SRT_INVALID_SOCK {
            Err(last_error())
        } else {
            Ok((client, peer.to_addr()))
        }
    }

    fn send(&self, sock: SocketId, data: &[u8]) -> Result<usize, TransportError> {
        let result = unsafe { srt_send(sock, data.as_ptr() as *const c_char, data.len() as c_int) };
        if result == SRT_ERROR {
            Err(last_error())
        } else {
            Ok(result as usize)
        }
    }

    fn recv(&self, sock: SocketId, buf: &mut [u8]) -> Result<usize, TransportError> {
        let result =
            unsafe { srt_recvmsg(sock, buf.as_mut_ptr() as *mut c_char, buf.len() as c_int) };
        if result == SRT_ERROR {
            Err(last_error())
        } else {
            Ok(result as usize)
        }
    }

    fn poll_create(&self) -> Result<PollId, TransportError> {
        let eid = unsafe { srt_epoll_create() };
        if eid < 0 {
            Err(last_error())
        } else {
            Ok(eid)
        }
    }

    fn poll_add(&self, poll: PollId, sock: SocketId) -> Result<(), TransportError> {
        let events = SRT_EPOLL_IN | SRT_EPOLL_ERR;
        check(unsafe { srt_epoll_add_usock(poll, sock, &events) })
    }

    fn poll_remove(&self, poll: PollId, sock: SocketId) {
        unsafe {
            srt_epoll_remove_usock(poll, sock);
        }
    }

    fn poll_wait(&self, poll: PollId, timeout: Duration) -> Result<usize, TransportError> {
        const SOCKS_TO_POLL: usize = 2;
        let mut ready = [SRT_INVALID_SOCK; SOCKS_TO_POLL];
        let mut count = SOCKS_TO_POLL as c_int;
        let result = unsafe {
            srt_epoll_wait(
                poll,
                ready.as_mut_ptr(),
                &mut count,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                timeout.as_millis().min(i64::MAX as u128) as i64,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if result >= 0 {
            return Ok(result as usize);
        }
        match last_error() {
            // An expired wait is not an error
            TransportError::TimedOut => {
                unsafe { srt_clearlasterror() };
                Ok(0)
            }
            other => Err(other),
        }
    }

    fn poll_release(&self, poll: PollId) {
        unsafe {
            srt_epoll_release(poll);
        }
    }
}
