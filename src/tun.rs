//! TUN device creation and interface configuration.
//!
//! Produces the non-blocking Layer 3 descriptor the router consumes. The
//! device is created with IFF_NO_PI, so reads yield raw IP packets with no
//! packet-information header. Requires CAP_NET_ADMIN.

use std::fs::{File, OpenOptions};
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use nix::libc;
use tracing::info;

/// TUN device flags from linux/if_tun.h
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// ifreq structure for TUN device creation
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22], // padding to match kernel struct size
}

/// ifreq structure for address/netmask configuration
#[repr(C)]
struct IfReqAddr {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_addr: libc::sockaddr_in,
    _pad: [u8; 8],
}

/// A configured Layer 3 TUN device.
#[derive(Debug)]
pub struct TunDevice {
    name: String,
    file: File,
}

impl TunDevice {
    /// Create a TUN device with the given interface name.
    ///
    /// The descriptor is opened with O_NONBLOCK so handler reads never park
    /// the event loop.
    pub fn create(name: &str) -> io::Result<Self> {
        if name.as_bytes().len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TUN device name too long",
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        copy_name(&mut ifr.ifr_name, name);

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        info!(name, "TUN device created");
        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    /// Interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw descriptor, for registration bookkeeping.
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Consume the device, yielding the descriptor for peer construction.
    pub fn into_fd(self) -> OwnedFd {
        self.file.into()
    }

    /// Assign an address and netmask and bring the interface up.
    ///
    /// Equivalent to `ifconfig <dev> <address> netmask <netmask> up`, done
    /// through an AF_INET ioctl socket.
    pub fn configure(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> io::Result<()> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = SockGuard(sock);

        let mut ifr = IfReqAddr {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_addr: ipv4_sockaddr(address),
            _pad: [0; 8],
        };
        copy_name(&mut ifr.ifr_name, &self.name);

        // SIOCSIFADDR
        let ret = unsafe { libc::ioctl(sock.0, libc::SIOCSIFADDR as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        // SIOCSIFNETMASK
        ifr.ifr_addr = ipv4_sockaddr(netmask);
        let ret = unsafe { libc::ioctl(sock.0, libc::SIOCSIFNETMASK as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        // Read-modify-write the interface flags to set IFF_UP.
        let mut flags_req = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: 0,
            _pad: [0; 22],
        };
        copy_name(&mut flags_req.ifr_name, &self.name);

        let ret = unsafe { libc::ioctl(sock.0, libc::SIOCGIFFLAGS as _, &flags_req) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        flags_req.ifr_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        let ret = unsafe { libc::ioctl(sock.0, libc::SIOCSIFFLAGS as _, &flags_req) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        info!(name = %self.name, address = %address, netmask = %netmask, "Interface configured");
        Ok(())
    }
}

/// Copy an interface name into an ifreq name field.
fn copy_name(field: &mut [libc::c_char; libc::IFNAMSIZ], name: &str) {
    for (i, byte) in name.bytes().enumerate() {
        if i >= libc::IFNAMSIZ - 1 {
            break;
        }
        field[i] = byte as libc::c_char;
    }
}

/// An IPv4 sockaddr for ifreq configuration, port zero.
fn ipv4_sockaddr(addr: Ipv4Addr) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            // Octets are already in network order.
            s_addr: u32::from_ne_bytes(addr.octets()),
        },
        sin_zero: [0; 8],
    }
}

/// RAII guard for the configuration socket.
struct SockGuard(RawFd);

impl Drop for SockGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}
