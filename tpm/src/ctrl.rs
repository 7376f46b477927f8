// Copyright © 2022, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! swtpm control channel protocol.
//!
//! Control commands travel over a UNIX socket as a big-endian command
//! number followed by an optional payload; every response leads with a
//! big-endian result code.
//!
//! Reference: https://github.com/stefanberger/swtpm/blob/master/man/man3/swtpm_ioctls.pod

use thiserror::Error;

/* capability flags returned by PTM_GET_CAPABILITY */
pub const PTM_CAP_INIT: u64 = 1;
pub const PTM_CAP_SHUTDOWN: u64 = 1 << 1;
pub const PTM_CAP_GET_TPMESTABLISHED: u64 = 1 << 2;
pub const PTM_CAP_SET_LOCALITY: u64 = 1 << 3;
pub const PTM_CAP_CANCEL_TPM_CMD: u64 = 1 << 5;
pub const PTM_CAP_RESET_TPMESTABLISHED: u64 = 1 << 7;
pub const PTM_CAP_STOP: u64 = 1 << 10;
pub const PTM_CAP_SET_DATAFD: u64 = 1 << 12;
pub const PTM_CAP_SET_BUFFERSIZE: u64 = 1 << 13;

#[derive(Debug, Clone, Copy)]
pub enum Commands {
    CmdGetCapability = 1,
    CmdInit,
    CmdShutdown,
    CmdGetTpmEstablished,
    CmdSetLocality,
    CmdHashStart,
    CmdHashData,
    CmdHashEnd,
    CmdCancelTpmCmd,
    CmdStoreVolatile,
    CmdResetTpmEstablished,
    CmdGetStateBlob,
    CmdSetStateBlob,
    CmdStop,
    CmdGetConfig,
    CmdSetDatafd,
    CmdSetBufferSize,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Control response is too short: got {got} bytes, expected at least {want}")]
    Truncated { got: usize, want: usize },
}
type Result<T> = std::result::Result<T, Error>;

/// Marshal a control request: command number, then the payload.
pub fn encode_request(cmd: Commands, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(cmd as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn be_u32(buf: &[u8], at: usize) -> Result<u32> {
    match buf.get(at..at + 4) {
        Some(b) => Ok(u32::from_be_bytes(b.try_into().unwrap())),
        None => Err(Error::Truncated {
            got: buf.len(),
            want: at + 4,
        }),
    }
}

/// Result code leading every control response.
pub fn parse_result(buf: &[u8]) -> Result<u32> {
    be_u32(buf, 0)
}

/// PTM_GET_CAPABILITY: a single u64 whose high word doubles as the result
/// code.
pub fn parse_capabilities(buf: &[u8]) -> Result<u64> {
    match buf.get(..8) {
        Some(b) => Ok(u64::from_be_bytes(b.try_into().unwrap())),
        None => Err(Error::Truncated {
            got: buf.len(),
            want: 8,
        }),
    }
}

/// PTM_GET_TPMESTABLISHED: result code, then the flag byte.
pub fn parse_established(buf: &[u8]) -> Result<bool> {
    match buf.get(4) {
        Some(&bit) => Ok(bit != 0),
        None => Err(Error::Truncated {
            got: buf.len(),
            want: 5,
        }),
    }
}

/// Buffer size negotiation outcome of PTM_SET_BUFFERSIZE.
///
/// The accepted size may differ from the requested one when the request
/// fell outside the backend's `[minsize, maxsize]` range.
#[derive(Debug, Clone, Copy)]
pub struct BufferSizes {
    pub bufsize: u32,
    pub minsize: u32,
    pub maxsize: u32,
}

/// PTM_SET_BUFFERSIZE: result code, then the accepted/min/max sizes.
pub fn parse_buffer_sizes(buf: &[u8]) -> Result<BufferSizes> {
    Ok(BufferSizes {
        bufsize: be_u32(buf, 4)?,
        minsize: be_u32(buf, 8)?,
        maxsize: be_u32(buf, 12)?,
    })
}
