//! Controller transport abstraction
//!
//! The core operates over an opaque byte-oriented channel to an HCI
//! controller. Each inbound delivery must be exactly one HCI packet; the
//! embedder owns the read loop and feeds packets to
//! [`crate::BleHost::handle_packet`].

use std::io;

/// A duplex byte channel to an HCI controller.
///
/// Implementations only need to deliver complete packets in each direction;
/// the adapter performs all framing above this.
pub trait Transport: Send {
    /// Writes one complete HCI packet (type byte included) to the controller.
    fn write(&mut self, packet: &[u8]) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, packet: &[u8]) -> io::Result<()> {
        (**self).write(packet)
    }
}

#[cfg(unix)]
pub use self::hci_socket::HciSocketTransport;

#[cfg(unix)]
mod hci_socket {
    use super::Transport;
    use std::io;
    use std::os::unix::io::{AsRawFd, RawFd};

    const AF_BLUETOOTH: i32 = 31;
    const BTPROTO_HCI: i32 = 1;
    const HCI_CHANNEL_USER: u16 = 1;

    #[repr(C)]
    struct SockaddrHci {
        hci_family: libc::sa_family_t,
        hci_dev: u16,
        hci_channel: u16,
    }

    /// A raw HCI user-channel socket on Linux.
    ///
    /// Grants the process exclusive access to the controller, which is what a
    /// host stack needs; requires CAP_NET_ADMIN.
    #[derive(Debug)]
    pub struct HciSocketTransport {
        fd: RawFd,
    }

    impl HciSocketTransport {
        /// Opens the HCI device `dev_id` (0 for the first controller).
        pub fn open(dev_id: u16) -> io::Result<Self> {
            let fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_RAW, BTPROTO_HCI) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let addr = SockaddrHci {
                hci_family: AF_BLUETOOTH as libc::sa_family_t,
                hci_dev: dev_id,
                hci_channel: HCI_CHANNEL_USER,
            };

            let result = unsafe {
                libc::bind(
                    fd,
                    &addr as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
                )
            };
            if result < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }

            Ok(HciSocketTransport { fd })
        }

        /// Reads one HCI packet into `buf`, returning its length.
        ///
        /// The kernel delivers whole packets on this socket type, so one read
        /// is one packet.
        pub fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
            let n = unsafe {
                libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }
    }

    impl Transport for HciSocketTransport {
        fn write(&mut self, packet: &[u8]) -> io::Result<()> {
            let n = unsafe {
                libc::write(
                    self.fd,
                    packet.as_ptr() as *const libc::c_void,
                    packet.len(),
                )
            };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }

    impl AsRawFd for HciSocketTransport {
        fn as_raw_fd(&self) -> RawFd {
            self.fd
        }
    }

    impl Drop for HciSocketTransport {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
