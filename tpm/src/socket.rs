// Copyright © 2022, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io;
use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;

use thiserror::Error;
use vmm_sys_util::sock_ctrl_msg::ScmSocket;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot connect to the swtpm control socket")]
    ConnectToSocket(#[source] io::Error),
    #[error("Failed to read from the control socket: {0}")]
    ReadFromSocket(String),
    #[error("Failed to write to the control socket: {0}")]
    WriteToSocket(String),
}
type Result<T> = std::result::Result<T, Error>;

/// Control channel to a swtpm process.
///
/// The data channel fd handed over with `set_msgfd` rides along the next
/// successful write as an SCM_RIGHTS message, and only that one.
pub struct SocketDev {
    stream: Option<UnixStream>,
    write_msgfd: RawFd,
}

impl Default for SocketDev {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketDev {
    pub fn new() -> Self {
        Self {
            stream: None,
            write_msgfd: -1,
        }
    }

    pub fn connect(&mut self, socket_path: &str) -> Result<()> {
        let s = UnixStream::connect(socket_path).map_err(Error::ConnectToSocket)?;
        debug!("Connected to swtpm socket path: {socket_path:?}");
        self.stream = Some(s);
        Ok(())
    }

    /// Queue `fd` for handoff with the next write.
    pub fn set_msgfd(&mut self, fd: RawFd) {
        self.write_msgfd = fd;
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(Error::WriteToSocket(
                "Control socket is not connected".to_string(),
            ));
        };

        let written = if self.write_msgfd >= 0 {
            stream.send_with_fd(buf, self.write_msgfd).map_err(|e| {
                Error::WriteToSocket(format!("Failed to write to socket: {e:?}"))
            })?
        } else {
            let mut s = stream;
            s.write(buf)
                .map_err(|e| Error::WriteToSocket(format!("Failed to write to socket: {e:?}")))?
        };

        // The data channel fd travels exactly once.
        if written > 0 {
            self.write_msgfd = -1;
        }
        Ok(written)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(Error::ReadFromSocket(
                "Control socket is not connected".to_string(),
            ));
        };
        let mut s = stream;
        s.read(buf)
            .map_err(|e| Error::ReadFromSocket(format!("Failed to read from socket: {e:?}")))
    }
}
