//! Bluetooth classic reachability probe using L2CAP echo requests
//!
//! This is the equivalent of `l2ping`: connect a raw L2CAP socket to the
//! target, send echo requests and wait for the matching echo response.
//! The probe is blocking; run it on the blocking pool.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Signalling command header: code, identifier, length (little-endian)
pub const L2CAP_HEADER_SIZE: usize = 4;
/// Payload carried by each echo request
pub const L2CAP_DATA_SIZE: usize = 20;
pub const L2CAP_FRAME_SIZE: usize = L2CAP_HEADER_SIZE + L2CAP_DATA_SIZE;

pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_ECHO_REQUEST: u8 = 0x08;
pub const L2CAP_ECHO_RESPONSE: u8 = 0x09;

/// SDP, always available on classic devices
pub const DEFAULT_PSM: u16 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid bluetooth address: {0}")]
pub struct InvalidAddress(String);

/// Bluetooth device address, stored in the little-endian order used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    pub const ANY: BdAddr = BdAddr([0; 6]);
}

impl FromStr for BdAddr {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(InvalidAddress(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(InvalidAddress(s.to_string()));
            }
            bytes[5 - i] = u8::from_str_radix(part, 16).map_err(|_| InvalidAddress(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

/// Retry policy of a probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoSettings {
    /// Echo requests sent before giving up
    pub attempts: u8,
    /// How long to wait for the reply to one request
    pub reply_timeout_ms: u64,
    /// Pause after a request timed out
    pub retry_delay_ms: u64,
    pub psm: u16,
}

impl Default for EchoSettings {
    fn default() -> Self {
        Self {
            attempts: 5,
            reply_timeout_ms: 5000,
            retry_delay_ms: 1000,
            psm: DEFAULT_PSM,
        }
    }
}

/// Result of a probe. Only `Reachable` means the device answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    /// The peer answered with a command reject: it does not support echo
    Rejected,
    /// No answer, or the socket could not be used
    Unreachable,
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Reachable)
    }
}

/// Connected signalling channel to one device
pub trait EchoChannel {
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Wait up to `timeout` for one frame; `Ok(None)` on timeout
    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;
}

/// Echo request frame with identifier `id` and a fixed payload
pub fn echo_request(id: u8) -> [u8; L2CAP_FRAME_SIZE] {
    let mut frame = [0u8; L2CAP_FRAME_SIZE];
    frame[0] = L2CAP_ECHO_REQUEST;
    frame[1] = id;
    frame[2..4].copy_from_slice(&(L2CAP_DATA_SIZE as u16).to_le_bytes());
    for (i, byte) in frame[L2CAP_HEADER_SIZE..].iter_mut().enumerate() {
        *byte = b'A' + (i % 40) as u8;
    }
    frame
}

/// Run the echo exchange over an already connected channel
pub fn run_echo<C: EchoChannel>(channel: &mut C, settings: &EchoSettings) -> ProbeOutcome {
    let reply_timeout = Duration::from_millis(settings.reply_timeout_ms);
    let retry_delay = Duration::from_millis(settings.retry_delay_ms);
    let mut buf = [0u8; L2CAP_FRAME_SIZE];

    for id in 1..=settings.attempts {
        if let Err(e) = channel.send(&echo_request(id)) {
            debug!(error = %e, "L2CAP write failed");
            return ProbeOutcome::Unreachable;
        }

        let deadline = Instant::now() + reply_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let len = match channel.recv_timeout(&mut buf, remaining) {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "L2CAP receive failed");
                    return ProbeOutcome::Unreachable;
                }
            };
            if len == 0 {
                debug!("L2CAP channel closed by peer");
                return ProbeOutcome::Unreachable;
            }
            if len < L2CAP_HEADER_SIZE || buf[1] != id {
                trace!(len, id, "Ignoring unrelated L2CAP frame");
                continue;
            }
            match buf[0] {
                L2CAP_ECHO_RESPONSE => return ProbeOutcome::Reachable,
                L2CAP_COMMAND_REJECT => {
                    debug!("Peer doesn't support echo requests");
                    return ProbeOutcome::Rejected;
                }
                code => trace!(code, "Ignoring L2CAP command"),
            }
        }

        trace!(id, attempts = settings.attempts, "L2CAP echo timed out");
        if id < settings.attempts && !retry_delay.is_zero() {
            std::thread::sleep(retry_delay);
        }
    }

    ProbeOutcome::Unreachable
}

/// Probe `target` over a raw L2CAP socket
pub fn probe(target: BdAddr, settings: &EchoSettings) -> ProbeOutcome {
    let mut socket = match socket::L2capSocket::connect(target, settings.psm) {
        Ok(socket) => socket,
        Err(e) => {
            debug!(target = %target, error = %e, "Can't connect L2CAP socket");
            return ProbeOutcome::Unreachable;
        }
    };
    debug!(target = %target, size = L2CAP_DATA_SIZE, "Sending L2CAP echo");
    run_echo(&mut socket, settings)
}

#[cfg(target_os = "linux")]
mod socket {
    use super::{BdAddr, EchoChannel};
    use std::io;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::time::Duration;

    const BTPROTO_L2CAP: libc::c_int = 0;

    /// `struct sockaddr_l2` from the BlueZ headers
    #[repr(C)]
    struct SockaddrL2 {
        l2_family: libc::sa_family_t,
        l2_psm: u16,
        l2_bdaddr: [u8; 6],
        l2_cid: u16,
        l2_bdaddr_type: u8,
    }

    impl SockaddrL2 {
        fn new(addr: BdAddr, psm: u16) -> Self {
            Self {
                l2_family: libc::AF_BLUETOOTH as libc::sa_family_t,
                l2_psm: psm.to_le(),
                l2_bdaddr: addr.0,
                l2_cid: 0,
                l2_bdaddr_type: 0,
            }
        }
    }

    pub struct L2capSocket {
        fd: OwnedFd,
    }

    fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        }
    }

    impl L2capSocket {
        pub fn connect(target: BdAddr, psm: u16) -> io::Result<Self> {
            // SAFETY: plain socket(2) call, the descriptor is owned right away
            let raw =
                check(unsafe { libc::socket(libc::AF_BLUETOOTH, libc::SOCK_RAW, BTPROTO_L2CAP) })?;
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            let local = SockaddrL2::new(BdAddr::ANY, 0);
            // SAFETY: `local` is a valid sockaddr_l2 for the duration of the call
            check(unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &local as *const SockaddrL2 as *const libc::sockaddr,
                    mem::size_of::<SockaddrL2>() as libc::socklen_t,
                )
            })?;

            let remote = SockaddrL2::new(target, psm);
            // SAFETY: `remote` is a valid sockaddr_l2 for the duration of the call
            check(unsafe {
                libc::connect(
                    fd.as_raw_fd(),
                    &remote as *const SockaddrL2 as *const libc::sockaddr,
                    mem::size_of::<SockaddrL2>() as libc::socklen_t,
                )
            })?;

            Ok(Self { fd })
        }
    }

    impl EchoChannel for L2capSocket {
        fn send(&mut self, frame: &[u8]) -> io::Result<()> {
            // SAFETY: the pointer and length come from a live slice
            let written =
                unsafe { libc::write(self.fd.as_raw_fd(), frame.as_ptr().cast(), frame.len()) };
            if written < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
            let mut pfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
            // SAFETY: one valid pollfd
            let ready = check(unsafe { libc::poll(&mut pfd, 1, timeout_ms) })?;
            if ready == 0 {
                return Ok(None);
            }
            // SAFETY: the pointer and length come from a live mutable slice
            let len =
                unsafe { libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
            if len < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Some(len as usize))
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod socket {
    use super::{BdAddr, EchoChannel};
    use std::io;
    use std::time::Duration;

    pub struct L2capSocket;

    impl L2capSocket {
        pub fn connect(_target: BdAddr, _psm: u16) -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "L2CAP sockets are only available on Linux",
            ))
        }
    }

    impl EchoChannel for L2capSocket {
        fn send(&mut self, _frame: &[u8]) -> io::Result<()> {
            Err(io::ErrorKind::Unsupported.into())
        }

        fn recv_timeout(
            &mut self,
            _buf: &mut [u8],
            _timeout: Duration,
        ) -> io::Result<Option<usize>> {
            Err(io::ErrorKind::Unsupported.into())
        }
    }
}
