//! The upstream link to the microcontroller: either a real USB serial
//! device, or (for testing/nesting) a Unix-domain stream socket to another
//! `luatt` instance's attach server.
//!
//! Modeled as a sum type rather than a trait object, per the two concrete
//! shapes this protocol runs over — there is no third transport kind to
//! plan for.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use bytes::BytesMut;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg};
use nix::unistd;
use thiserror::Error;
use tokio::net::UnixStream;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: nix::Error,
    },
    #[error("termios configuration failed: {0}")]
    Termios(#[source] nix::Error),
    #[error("connect {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stat {path}: {source}")]
    Probe {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: not a character device or a socket")]
    NotDeviceOrSocket { path: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The upstream link the router reads frames from and writes frames to.
pub enum Transport {
    Serial(SerialPort),
    Local(UnixStream),
}

impl Transport {
    pub async fn open_serial(path: &str) -> Result<Self, TransportError> {
        Ok(Transport::Serial(SerialPort::open(path)?))
    }

    pub async fn connect_local(path: &str) -> Result<Self, TransportError> {
        let stream =
            UnixStream::connect(path)
                .await
                .map_err(|e| TransportError::Connect {
                    path: path.to_string(),
                    source: e,
                })?;
        Ok(Transport::Local(stream))
    }

    /// Open `path`, probing its file mode to decide whether it's a serial
    /// character device or a local stream socket. Returns the transport
    /// plus whether it turned out to be the serial variant.
    pub async fn open(path: &str) -> Result<(Self, bool), TransportError> {
        use std::os::unix::fs::FileTypeExt;

        let meta = std::fs::metadata(path).map_err(|e| TransportError::Probe {
            path: path.to_string(),
            source: e,
        })?;
        let file_type = meta.file_type();

        if file_type.is_char_device() {
            Ok((Self::open_serial(path).await?, true))
        } else if file_type.is_socket() {
            Ok((Self::connect_local(path).await?, false))
        } else {
            Err(TransportError::NotDeviceOrSocket {
                path: path.to_string(),
            })
        }
    }

    /// Read whatever bytes are currently available into `buf`, returning
    /// the number of bytes read (0 means EOF/closed).
    pub async fn read(&mut self, buf: &mut BytesMut) -> Result<usize, TransportError> {
        match self {
            Transport::Serial(port) => port.read(buf).await,
            Transport::Local(stream) => {
                use tokio::io::AsyncReadExt;
                let mut chunk = [0u8; 4096];
                let n = stream.read(&mut chunk).await?;
                buf.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        match self {
            Transport::Serial(port) => port.write_all(data).await,
            Transport::Local(stream) => {
                use tokio::io::AsyncWriteExt;
                stream.write_all(data).await?;
                Ok(())
            }
        }
    }
}

/// An open, termios-configured serial device.
pub struct SerialPort {
    fd: OwnedFd,
}

impl SerialPort {
    fn open(path: &str) -> Result<Self, TransportError> {
        let raw =
            fcntl::open(path, OFlag::O_RDWR | OFlag::O_NOCTTY, Mode::empty()).map_err(|e| {
                TransportError::Open {
                    path: path.to_string(),
                    source: e,
                }
            })?;
        // SAFETY: `raw` was just returned by a successful `open`, is not
        // shared, and ownership is transferred to `OwnedFd` here.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        configure_termios(fd.as_fd_borrowed())?;

        termios::tcflush(fd.as_fd_borrowed(), termios::FlushArg::TCIOFLUSH)
            .map_err(TransportError::Termios)?;

        Ok(SerialPort { fd })
    }

    async fn read(&mut self, buf: &mut BytesMut) -> Result<usize, TransportError> {
        let raw = self.fd.as_raw_fd();
        let (n, chunk) = tokio::task::spawn_blocking(move || {
            let mut chunk = [0u8; 4096];
            // SAFETY: `raw` remains open for the lifetime of this blocking
            // call since `self.fd` is not dropped until `.await` returns.
            let bfd = unsafe { BorrowedFd::borrow_raw(raw) };
            let n = unistd::read(&bfd, &mut chunk);
            (n, chunk)
        })
        .await
        .expect("blocking serial read task panicked");

        let n = n.map_err(|e| TransportError::Io(std::io::Error::from(e)))?;
        buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let raw = self.fd.as_raw_fd();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            // SAFETY: see `read` above.
            let bfd = unsafe { BorrowedFd::borrow_raw(raw) };
            let mut written = 0;
            while written < data.len() {
                let n = unistd::write(&bfd, &data[written..])
                    .map_err(|e| TransportError::Io(std::io::Error::from(e)))?;
                written += n;
            }
            Ok(())
        })
        .await
        .expect("blocking serial write task panicked")
    }
}

trait AsFdBorrowed {
    fn as_fd_borrowed(&self) -> BorrowedFd<'_>;
}

impl AsFdBorrowed for OwnedFd {
    fn as_fd_borrowed(&self) -> BorrowedFd<'_> {
        // SAFETY: `self` outlives the borrow, which is scoped to this call.
        unsafe { BorrowedFd::borrow_raw(self.as_raw_fd()) }
    }
}

/// Configure the serial fd for canonical (line-buffered), 9600 8N1 mode
/// with no flow control and no special characters — the microcontroller
/// firmware expects newline-terminated frames exactly as written, with
/// nothing mangled in transit.
fn configure_termios(fd: BorrowedFd<'_>) -> Result<(), TransportError> {
    let mut tio = termios::tcgetattr(&fd).map_err(TransportError::Termios)?;

    tio.input_flags = termios::InputFlags::IGNBRK | termios::InputFlags::IGNPAR;
    tio.output_flags = termios::OutputFlags::empty();
    tio.control_flags = termios::ControlFlags::CS8
        | termios::ControlFlags::CREAD
        | termios::ControlFlags::CLOCAL
        | termios::ControlFlags::HUPCL;
    tio.local_flags = termios::LocalFlags::ICANON;

    for i in 0..tio.control_chars.len() {
        tio.control_chars[i] = 0;
    }

    termios::cfsetispeed(&mut tio, BaudRate::B9600).map_err(TransportError::Termios)?;
    termios::cfsetospeed(&mut tio, BaudRate::B9600).map_err(TransportError::Termios)?;

    termios::tcsetattr(&fd, SetArg::TCSANOW, &tio).map_err(TransportError::Termios)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_nonexistent_serial_path_errors() {
        let err = SerialPort::open("/nonexistent/device/path/for/test");
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn connect_local_to_missing_socket_errors() {
        let err = Transport::connect_local("/nonexistent/socket/path/for/test").await;
        assert!(matches!(err, Err(TransportError::Connect { .. })));
    }

    #[tokio::test]
    async fn open_probes_missing_path_as_probe_error() {
        let err = Transport::open("/nonexistent/path/for/test").await;
        assert!(matches!(err, Err(TransportError::Probe { .. })));
    }

    #[tokio::test]
    async fn open_rejects_a_plain_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = Transport::open(file.path().to_str().unwrap()).await;
        assert!(matches!(err, Err(TransportError::NotDeviceOrSocket { .. })));
    }
}
