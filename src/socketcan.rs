//! Linux SocketCAN backend.
//!
//! The interface has to be up before it is opened:
//!
//! ```text
//! sudo ip link set can0 up type can bitrate 1000000
//! ```

use std::io;
use std::os::fd::AsRawFd;
use std::time::Duration;

use log::{debug, info, warn};
use socketcan::{
    CanDataFrame, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame as _, Id, Socket,
};

use crate::errors::{Result, TransportError};
use crate::frame::Frame;
use crate::transport::{CanDriver, Received};

/// `SIOCGSTAMP` from `<linux/sockios.h>`: kernel receive time of the last frame.
const SIOCGSTAMP: libc::c_ulong = 0x8906;

/// Receive timeout of one poll.
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// A raw CAN socket bound to one interface.
pub struct SocketCanDriver {
    socket: CanSocket,
    interface: String,
}

impl SocketCanDriver {
    /// Open and bind a raw socket on `interface` (e.g. `can0`, `vcan0`).
    pub fn open(interface: &str) -> Result<Self> {
        let socket = CanSocket::open(interface)
            .map_err(|e| TransportError::InvalidInterface(format!("{interface}: {e}")))?;
        socket.set_read_timeout(POLL_TIMEOUT)?;
        info!("SocketCAN interface {interface} opened");
        Ok(Self {
            socket,
            interface: interface.to_string(),
        })
    }

    /// Kernel receive timestamp of the last frame read.
    fn last_timestamp(&self) -> Duration {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let ret = unsafe {
            libc::ioctl(
                self.socket.as_raw_fd(),
                SIOCGSTAMP as _,
                &mut tv as *mut libc::timeval,
            )
        };
        if ret < 0 {
            return Duration::ZERO;
        }
        Duration::new(tv.tv_sec as u64, tv.tv_usec as u32 * 1000)
    }
}

/// Extended data frame carrying `frame`.
fn to_can_frame(frame: &Frame) -> std::result::Result<CanDataFrame, TransportError> {
    let raw = frame.identifier.encode();
    let id = ExtendedId::new(raw).ok_or_else(|| {
        TransportError::HardwareRejected(format!("identifier {raw:#010X} out of range"))
    })?;
    CanDataFrame::new(id, frame.payload())
        .ok_or_else(|| TransportError::HardwareRejected(format!("cannot build frame {raw:#010X}")))
}

/// Our frame for an extended data frame; `None` for everything else.
fn from_can_frame(frame: &CanFrame) -> Option<Frame> {
    match frame {
        CanFrame::Data(data) => match data.id() {
            Id::Extended(id) => Some(Frame::from_raw(id.as_raw(), data.data())),
            Id::Standard(_) => None,
        },
        CanFrame::Remote(_) | CanFrame::Error(_) => None,
    }
}

impl CanDriver for SocketCanDriver {
    fn write(&mut self, frame: &Frame) -> std::result::Result<(), TransportError> {
        let can_frame = to_can_frame(frame)?;
        match self.socket.write_frame(&can_frame) {
            Ok(()) => Ok(()),
            Err(e)
                if e.raw_os_error() == Some(libc::ENOBUFS)
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Err(TransportError::HardwareRejected(format!(
                    "{}: {e}",
                    self.interface
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read(&mut self) -> std::result::Result<Option<Received>, TransportError> {
        let can_frame = match self.socket.read_frame() {
            Ok(frame) => frame,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(None)
            }
            Err(e) => {
                warn!("{}: read failed: {e}", self.interface);
                return Err(TransportError::Overrun);
            }
        };
        let Some(frame) = from_can_frame(&can_frame) else {
            debug!("{}: skipping frame {:#010X}", self.interface, can_frame.raw_id());
            return Ok(None);
        };
        Ok(Some(Received {
            frame,
            device_timestamp: self.last_timestamp(),
        }))
    }

    fn close(&mut self) {
        debug!("closing SocketCAN interface {}", self.interface);
    }
}
