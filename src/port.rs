//! Test port abstraction
//!
//! A port moves whole Ethernet frames; the measurement loops neither know
//! nor care what backs it. The production implementation is an AF_PACKET
//! raw socket bound to one interface; tests wire two in-memory ports
//! back to back to run real sender/receiver pairs without hardware.

use std::io;

use thiserror::Error;

/// Maximum number of frames taken from a port per poll.
pub const MAX_PKT_BURST: usize = 32;

/// Receive buffer size; comfortably above the largest admitted frame.
pub const RX_BUF_SIZE: usize = 2048;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("network interface '{0}' does not exist")]
    NoSuchInterface(String),
    #[error("can't open raw socket on '{interface}': {source}")]
    Open {
        interface: String,
        #[source]
        source: io::Error,
    },
    #[error("can't configure '{interface}': {source}")]
    Configure {
        interface: String,
        #[source]
        source: io::Error,
    },
    #[error("Ethernet port '{0}' is DOWN")]
    LinkDown(String),
    #[error("send failed on '{interface}': {source}")]
    Send {
        interface: String,
        #[source]
        source: io::Error,
    },
    #[error("receive failed on '{interface}': {source}")]
    Receive {
        interface: String,
        #[source]
        source: io::Error,
    },
}

/// One received frame, copied out of the port.
#[derive(Clone)]
pub struct RxFrame {
    pub data: [u8; RX_BUF_SIZE],
    pub len: usize,
}

impl RxFrame {
    pub fn empty() -> Self {
        RxFrame {
            data: [0; RX_BUF_SIZE],
            len: 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// A unidirectionally used Ethernet test port.
pub trait TestPort: Send {
    /// Offers one frame to the port. `Ok(false)` means the port did not
    /// accept it right now and the caller should try again immediately.
    fn tx_burst(&mut self, frame: &[u8]) -> Result<bool, PortError>;

    /// Fills `frames` with whatever has arrived, up to `frames.len()`,
    /// without blocking. Returns the number of frames written.
    fn rx_burst(&mut self, frames: &mut [RxFrame]) -> Result<usize, PortError>;
}

impl<T: TestPort + ?Sized> TestPort for Box<T> {
    fn tx_burst(&mut self, frame: &[u8]) -> Result<bool, PortError> {
        (**self).tx_burst(frame)
    }

    fn rx_burst(&mut self, frames: &mut [RxFrame]) -> Result<usize, PortError> {
        (**self).rx_burst(frames)
    }
}

#[cfg(target_os = "linux")]
pub use self::raw_socket::RawSocketPort;

#[cfg(target_os = "linux")]
mod raw_socket {
    use super::*;
    use std::ffi::CString;
    use std::os::fd::RawFd;

    use tracing::{debug, info};

    /// An AF_PACKET socket bound to one interface, non-blocking in both
    /// directions.
    #[derive(Debug)]
    pub struct RawSocketPort {
        fd: RawFd,
        interface: String,
    }

    impl RawSocketPort {
        pub fn open(interface: &str, promiscuous: bool) -> Result<Self, PortError> {
            let name = CString::new(interface)
                .map_err(|_| PortError::NoSuchInterface(interface.to_string()))?;
            let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
            if ifindex == 0 {
                return Err(PortError::NoSuchInterface(interface.to_string()));
            }

            let fd = unsafe {
                libc::socket(
                    libc::AF_PACKET,
                    libc::SOCK_RAW,
                    i32::from((libc::ETH_P_ALL as u16).to_be()),
                )
            };
            if fd < 0 {
                return Err(PortError::Open {
                    interface: interface.to_string(),
                    source: io::Error::last_os_error(),
                });
            }
            let port = RawSocketPort {
                fd,
                interface: interface.to_string(),
            };

            let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
            addr.sll_family = libc::AF_PACKET as u16;
            addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
            addr.sll_ifindex = ifindex as i32;
            let rc = unsafe {
                libc::bind(
                    port.fd,
                    &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(port.configure_error());
            }

            let flags = unsafe { libc::fcntl(port.fd, libc::F_GETFL) };
            if flags < 0
                || unsafe { libc::fcntl(port.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
            {
                return Err(port.configure_error());
            }

            if promiscuous {
                let mut mreq: libc::packet_mreq = unsafe { std::mem::zeroed() };
                mreq.mr_ifindex = ifindex as i32;
                mreq.mr_type = libc::PACKET_MR_PROMISC as u16;
                let rc = unsafe {
                    libc::setsockopt(
                        port.fd,
                        libc::SOL_PACKET,
                        libc::PACKET_ADD_MEMBERSHIP,
                        &mreq as *const libc::packet_mreq as *const libc::c_void,
                        std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
                    )
                };
                if rc < 0 {
                    return Err(port.configure_error());
                }
                info!("promiscuous mode enabled on '{interface}'");
            }

            debug!("raw socket opened on '{interface}' (ifindex {ifindex})");
            Ok(port)
        }

        /// Polls the carrier state until the link comes up, at most
        /// `trials` times.
        pub fn wait_link_up(&self, trials: usize) -> Result<(), PortError> {
            for _ in 0..trials {
                let carrier =
                    std::fs::read_to_string(format!("/sys/class/net/{}/carrier", self.interface));
                if matches!(carrier, Ok(ref c) if c.trim() == "1") {
                    return Ok(());
                }
                std::thread::sleep(std::time::Duration::from_millis(500));
            }
            Err(PortError::LinkDown(self.interface.clone()))
        }

        fn configure_error(&self) -> PortError {
            PortError::Configure {
                interface: self.interface.clone(),
                source: io::Error::last_os_error(),
            }
        }
    }

    impl TestPort for RawSocketPort {
        fn tx_burst(&mut self, frame: &[u8]) -> Result<bool, PortError> {
            let rc = unsafe {
                libc::send(
                    self.fd,
                    frame.as_ptr() as *const libc::c_void,
                    frame.len(),
                    0,
                )
            };
            if rc >= 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // TX ring momentarily full; the caller spins, exactly
                // like on a saturated NIC queue.
                Some(libc::EAGAIN) | Some(libc::ENOBUFS) => Ok(false),
                _ => Err(PortError::Send {
                    interface: self.interface.clone(),
                    source: err,
                }),
            }
        }

        fn rx_burst(&mut self, frames: &mut [RxFrame]) -> Result<usize, PortError> {
            let mut received = 0;
            while received < frames.len() {
                let slot = &mut frames[received];
                let mut from: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
                let mut from_len =
                    std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
                let rc = unsafe {
                    libc::recvfrom(
                        self.fd,
                        slot.data.as_mut_ptr() as *mut libc::c_void,
                        slot.data.len(),
                        0,
                        &mut from as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                        &mut from_len,
                    )
                };
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EAGAIN) {
                        break;
                    }
                    return Err(PortError::Receive {
                        interface: self.interface.clone(),
                        source: err,
                    });
                }
                // The socket also taps frames this host transmits on the
                // interface; only frames arriving from the wire count.
                if from.sll_pkttype == libc::PACKET_OUTGOING as u8 {
                    continue;
                }
                slot.len = rc as usize;
                received += 1;
            }
            Ok(received)
        }
    }

    impl Drop for RawSocketPort {
        fn drop(&mut self) {
            unsafe { libc::close(self.fd) };
        }
    }
}

/// In-memory port pair: whatever one side transmits, the other receives.
pub struct LoopbackPort {
    tx: crossbeam_channel::Sender<Vec<u8>>,
    rx: crossbeam_channel::Receiver<Vec<u8>>,
}

impl LoopbackPort {
    /// Creates two ports wired back to back, like a cable between them.
    pub fn pair() -> (LoopbackPort, LoopbackPort) {
        let (a_tx, a_rx) = crossbeam_channel::unbounded();
        let (b_tx, b_rx) = crossbeam_channel::unbounded();
        (
            LoopbackPort { tx: a_tx, rx: b_rx },
            LoopbackPort { tx: b_tx, rx: a_rx },
        )
    }
}

impl TestPort for LoopbackPort {
    fn tx_burst(&mut self, frame: &[u8]) -> Result<bool, PortError> {
        // A disconnected peer behaves like a wire nobody listens on.
        let _ = self.tx.send(frame.to_vec());
        Ok(true)
    }

    fn rx_burst(&mut self, frames: &mut [RxFrame]) -> Result<usize, PortError> {
        let mut received = 0;
        while received < frames.len() {
            match self.rx.try_recv() {
                Ok(data) => {
                    let slot = &mut frames[received];
                    let len = data.len().min(RX_BUF_SIZE);
                    slot.data[..len].copy_from_slice(&data[..len]);
                    slot.len = len;
                    received += 1;
                }
                Err(_) => break,
            }
        }
        Ok(received)
    }
}
