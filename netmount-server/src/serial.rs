//! Serial device access for the built-in SLIP transport.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// A serial port configured for raw byte I/O.
pub struct SerialPort {
    file: File,
}

impl SerialPort {
    pub fn open(device: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(device)?;
        Ok(SerialPort { file })
    }

    /// Switches the line to raw 8N1 at `baud_rate`, with optional RTS/CTS
    /// hardware flow control, and flushes stale bytes.
    pub fn setup(&mut self, baud_rate: u32, rts_cts: bool) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        let speed = speed_constant(baud_rate)?;

        let mut tio: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
            return Err(io::Error::last_os_error());
        }

        unsafe { libc::cfmakeraw(&mut tio) };
        if unsafe { libc::cfsetispeed(&mut tio, speed) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::cfsetospeed(&mut tio, speed) } != 0 {
            return Err(io::Error::last_os_error());
        }

        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        if rts_cts {
            tio.c_cflag |= libc::CRTSCTS;
        } else {
            tio.c_cflag &= !libc::CRTSCTS;
        }
        // block until a single byte arrives
        tio.c_cc[libc::VMIN] = 1;
        tio.c_cc[libc::VTIME] = 0;

        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { libc::tcflush(fd, libc::TCIOFLUSH) };
        Ok(())
    }

    /// Blocking single-byte read; `None` on end of stream or interruption.
    pub fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.file.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)
    }

    pub fn raw_fd(&self) -> i32 {
        self.file.as_raw_fd()
    }
}

fn speed_constant(baud_rate: u32) -> io::Result<libc::speed_t> {
    let speed = match baud_rate {
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        #[cfg(target_os = "linux")]
        460800 => libc::B460800,
        #[cfg(target_os = "linux")]
        921600 => libc::B921600,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported serial speed {baud_rate}"),
            ))
        }
    };
    Ok(speed)
}
