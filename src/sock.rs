//! The UDP transport underneath a host.
//!
//! One nonblocking socket, bound to an ephemeral port, with every send
//! going to a fixed destination (normally the well-known multicast group).
//! Replies arrive on the same socket; readiness is a plain `poll(2)`.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::msg::Message;

const IFNAMSIZ: usize = 16;

/// An `ifreq` large enough for the kernel's copy on `SIOCGIFADDR`.
#[repr(C)]
#[allow(non_camel_case_types)]
struct ifreq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_addr: libc::sockaddr,
    _pad: [u8; 8],
}

pub(crate) trait IntoResult<T> {
    fn into_result(self) -> io::Result<T>;
}

impl IntoResult<i32> for i32 {
    fn into_result(self) -> io::Result<i32> {
        if self < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(self)
        }
    }
}

/// Looks up the primary IPv4 address of a local interface.
pub fn interface_addr(interface: &str) -> Result<Ipv4Addr> {
    if interface.is_empty() || interface.len() >= IFNAMSIZ {
        return Err(Error::Protocol(format!(
            "invalid interface name {:?}",
            interface
        )));
    }

    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    let mut req: ifreq = unsafe { mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(interface.as_bytes()) {
        *dst = *src as libc::c_char;
    }

    unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFADDR, &mut req) }.into_result()?;

    let sin = unsafe { &*(&req.ifr_addr as *const libc::sockaddr as *const libc::sockaddr_in) };
    Ok(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
}

fn set_mcast_if(sock: &UdpSocket, local: Ipv4Addr) -> io::Result<()> {
    let addr = libc::in_addr {
        s_addr: u32::from(local).to_be(),
    };

    unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
            &addr as *const _ as *const _,
            mem::size_of::<libc::in_addr>() as libc::socklen_t,
        )
    }
    .into_result()
    .map(|_| ())
}

fn poll_millis(timeout: Duration) -> libc::c_int {
    let ms = timeout.as_millis();
    if ms == 0 && timeout.subsec_nanos() > 0 {
        1
    } else {
        ms.min(i32::MAX as u128) as libc::c_int
    }
}

/// One bound datagram socket with a fixed destination.
#[derive(Debug)]
pub struct Link {
    sock: UdpSocket,
    dest: SocketAddr,
    max_dgram: usize,
}

impl Link {
    /// Binds an ephemeral port and pins multicast egress to `interface`.
    pub fn open(interface: &str, dest: SocketAddr, max_dgram: usize) -> Result<Link> {
        let local = interface_addr(interface)?;
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        sock.set_nonblocking(true)?;
        set_mcast_if(&sock, local)?;

        debug!(
            "link {} -> {} via {} ({})",
            sock.local_addr()?,
            dest,
            interface,
            local
        );

        Ok(Link {
            sock,
            dest,
            max_dgram,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Transmits one envelope. No retransmission at this layer.
    pub fn send(&self, msg: &Message) -> Result<()> {
        let buf = msg.encode()?;
        if buf.len() > self.max_dgram {
            return Err(Error::Protocol(format!(
                "message of {} bytes exceeds the {} byte datagram limit",
                buf.len(),
                self.max_dgram
            )));
        }

        debug!("sending: {}", String::from_utf8_lossy(&buf));
        self.sock.send_to(&buf, self.dest)?;
        Ok(())
    }

    /// Drains the socket until a message passes the filter or nothing is
    /// left to read.
    ///
    /// Accepted messages have a non-empty sender and type, are addressed to
    /// `ident`, match `seq` (unless `seq` is 0) and, when given, `msg_type`.
    /// Everything else is dropped silently.
    pub fn recv_one(&self, ident: &str, seq: u32, msg_type: Option<&str>) -> Result<Option<Message>> {
        let mut buf = vec![0u8; self.max_dgram];
        loop {
            let len = match self.sock.recv(&mut buf) {
                Ok(len) => len,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err.into()),
            };

            let msg = match Message::decode(&buf[..len]) {
                Some(msg) => msg,
                None => continue,
            };

            if msg.from.is_empty()
                || msg.msg_type.is_empty()
                || msg.to != ident
                || (seq != 0 && msg.seq != seq)
                || msg_type.map_or(false, |wanted| msg.msg_type != wanted)
            {
                continue;
            }

            debug!("received: {:?}", msg);
            return Ok(Some(msg));
        }
    }

    /// Sleeps until a datagram is readable or `timeout` elapses.
    ///
    /// A caught signal counts as an early wake-up, not an error.
    pub fn poll(&self, timeout: Duration) -> Result<bool> {
        let mut fds = [libc::pollfd {
            fd: self.sock.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];

        match unsafe { libc::poll(fds.as_mut_ptr(), 1, poll_millis(timeout)) }.into_result() {
            Ok(ready) => Ok(ready > 0),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
