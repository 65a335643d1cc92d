//! Character-device backend.
//!
//! Every operation opens the node read+write with `O_NONBLOCK` and closes
//! it on return. The frame is written and read back at offset 0, matching a
//! driver that keeps a single input and a single output buffer. The whole
//! exchange, write included, runs against one deadline: whenever the device
//! answers `EAGAIN`, `poll` waits for the rest of the budget and the round
//! trip fails with `DeviceError::Timeout` once it is spent.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use super::{DeviceConfig, DeviceError, TransformDevice};

pub struct CharDevice {
    path: String,
    ioctl_command: u32,
    timeout: Duration,
}

impl CharDevice {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            path: config.path.clone(),
            ioctl_command: config.ioctl_command,
            timeout: config.timeout,
        }
    }

    fn open(&self) -> Result<File, DeviceError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|source| DeviceError::Unavailable {
                path: self.path.clone(),
                source,
            })
    }
}

impl TransformDevice for CharDevice {
    fn set_mode(&mut self, enabled: bool) -> Result<(), DeviceError> {
        let file = self.open()?;
        let value: libc::c_int = i32::from(enabled);
        // SAFETY: the fd is open for the duration of the call and the driver
        // copies exactly sizeof(int) from the pointer.
        let ret = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                self.ioctl_command as _,
                &value as *const libc::c_int,
            )
        };
        if ret < 0 {
            return Err(DeviceError::ControlRejected(std::io::Error::last_os_error()));
        }
        log::debug!("CharDevice: {} mode set to {}", self.path, enabled);
        Ok(())
    }

    fn round_trip(&mut self, input: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let file = self.open()?;
        Exchange::new(&file, self.timeout).run(input)
    }
}

/// One write-then-read against a non-blocking fd, bounded by a deadline.
///
/// Positional I/O is used until the fd refuses it with `ESPIPE`; pipes and
/// sockets then fall back to plain sequential reads and writes.
struct Exchange<'a> {
    file: &'a File,
    timeout: Duration,
    deadline: Instant,
    positional: bool,
}

impl<'a> Exchange<'a> {
    fn new(file: &'a File, timeout: Duration) -> Self {
        Self {
            file,
            timeout,
            deadline: Instant::now() + timeout,
            positional: true,
        }
    }

    fn run(mut self, input: &[u8]) -> Result<Vec<u8>, DeviceError> {
        self.write_frame(input)?;
        self.read_frame(input.len())
    }

    fn write_frame(&mut self, input: &[u8]) -> Result<(), DeviceError> {
        let expected = input.len();
        let mut written = 0;
        while written < expected {
            match self.write_chunk(&input[written..], written) {
                Ok(0) => break,
                Ok(n) => {
                    written += n;
                    // The driver rewinds on every write, so a positional
                    // write has to land in one piece.
                    if self.positional && written < expected {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait(libc::POLLOUT).map_err(|source| DeviceError::ShortWrite {
                        expected,
                        written,
                        source: Some(source),
                    })??;
                }
                Err(source) => {
                    return Err(DeviceError::ShortWrite {
                        expected,
                        written,
                        source: Some(source),
                    })
                }
            }
        }
        if written != expected {
            return Err(DeviceError::ShortWrite {
                expected,
                written,
                source: None,
            });
        }
        Ok(())
    }

    fn read_frame(&mut self, expected: usize) -> Result<Vec<u8>, DeviceError> {
        let mut output = vec![0u8; expected];
        let mut read = 0;
        while read < expected {
            match self.read_chunk(&mut output[read..], read) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait(libc::POLLIN).map_err(|source| DeviceError::ShortRead {
                        expected,
                        read,
                        source: Some(source),
                    })??;
                }
                Err(source) => {
                    return Err(DeviceError::ShortRead {
                        expected,
                        read,
                        source: Some(source),
                    })
                }
            }
        }
        if read != expected {
            return Err(DeviceError::ShortRead {
                expected,
                read,
                source: None,
            });
        }
        Ok(output)
    }

    fn write_chunk(&mut self, buf: &[u8], offset: usize) -> io::Result<usize> {
        if self.positional {
            match self.file.write_at(buf, offset as u64) {
                Err(err) if err.raw_os_error() == Some(libc::ESPIPE) => self.positional = false,
                other => return other,
            }
        }
        let mut file = self.file;
        file.write(buf)
    }

    fn read_chunk(&mut self, buf: &mut [u8], offset: usize) -> io::Result<usize> {
        if self.positional {
            match self.file.read_at(buf, offset as u64) {
                Err(err) if err.raw_os_error() == Some(libc::ESPIPE) => self.positional = false,
                other => return other,
            }
        }
        let mut file = self.file;
        file.read(buf)
    }

    /// Wait until the fd reports `events` or the deadline passes. The outer
    /// error is a failed `poll`; the inner one is the timeout.
    fn wait(&self, events: libc::c_short) -> io::Result<Result<(), DeviceError>> {
        let mut pollfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events,
            revents: 0,
        };
        loop {
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Err(DeviceError::Timeout(self.timeout)));
            }
            let timeout_ms = remaining
                .as_millis()
                .clamp(1, libc::c_int::MAX as u128) as libc::c_int;
            // SAFETY: pollfd is a valid, exclusively borrowed array of length 1.
            let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
            match ret {
                0 => continue,
                n if n > 0 => return Ok(Ok(())),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
            }
        }
    }
}
