// Copyright © 2022, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::{mem, ptr, thread};

use anyhow::anyhow;
use libc::{c_void, sockaddr_storage, socklen_t};
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

use crate::ctrl::{
    self, Commands, PTM_CAP_CANCEL_TPM_CMD, PTM_CAP_GET_TPMESTABLISHED, PTM_CAP_INIT,
    PTM_CAP_RESET_TPMESTABLISHED, PTM_CAP_SET_BUFFERSIZE, PTM_CAP_SET_DATAFD,
    PTM_CAP_SET_LOCALITY, PTM_CAP_SHUTDOWN, PTM_CAP_STOP,
};
use crate::socket::SocketDev;
use crate::{
    BackendCmd, BackendCompletion, BackendError, TpmBackend, TpmVersion, TPM_BUFFER_MAX,
    TPM_FAIL, TPM_SUCCESS,
};

const TPM_REQ_HDR_SIZE: usize = 10;

/// Check if the input command is a self test.
pub fn is_selftest(input: &[u8]) -> bool {
    if input.len() >= TPM_REQ_HDR_SIZE {
        let ordinal: [u8; 4] = input[6..10]
            .try_into()
            .expect("slice with incorrect length");
        return u32::from_be_bytes(ordinal) == 0x143;
    }
    false
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not initialize emulator's backend: {0}")]
    InitializeEmulator(#[source] anyhow::Error),
    #[error("Failed to create data fd to pass to swtpm: {0}")]
    PrepareDataFd(#[source] anyhow::Error),
    #[error("Failed to run control command: {0}")]
    RunControlCmd(#[source] anyhow::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Completed commands waiting to be drained by the device.
struct CompletionQueue {
    completions: Mutex<VecDeque<BackendCompletion>>,
    notifier: EventFd,
}

/// TPM backend talking to a swtpm process.
///
/// The control channel (capabilities, init, cancel, established flag) is
/// driven synchronously from the device context. Command execution runs on
/// a worker thread owning the data channel, so `deliver_request` returns
/// before the TPM has produced a response.
pub struct Emulator {
    caps: u64,
    control_socket: SocketDev,
    data_fd: RawFd,
    established_flag: Option<bool>,
    had_startup_error: bool,
    cmd_tx: Sender<BackendCmd>,
    queue: Arc<CompletionQueue>,
    _worker: Option<thread::JoinHandle<()>>,
}

impl Emulator {
    /// Create an Emulator instance connected to the swtpm process listening
    /// on the UNIX domain socket at `path`.
    pub fn new(path: String) -> Result<Self> {
        if !Path::new(&path).exists() {
            return Err(Error::InitializeEmulator(anyhow!(
                "The input TPM socket path: {path:?} does not exist"
            )));
        }
        let mut socket = SocketDev::new();
        socket
            .connect(&path)
            .map_err(|e| Error::InitializeEmulator(anyhow!("{e:?}")))?;

        let queue = Arc::new(CompletionQueue {
            completions: Mutex::new(VecDeque::new()),
            notifier: EventFd::new(libc::EFD_NONBLOCK).map_err(|e| {
                Error::InitializeEmulator(anyhow!("Failed to create completion notifier: {e}"))
            })?,
        });
        let (cmd_tx, cmd_rx) = channel();

        let mut emulator = Self {
            caps: 0,
            control_socket: socket,
            data_fd: -1,
            established_flag: None,
            had_startup_error: false,
            cmd_tx,
            queue,
            _worker: None,
        };

        emulator.prepare_data_fd()?;

        emulator.probe_caps()?;
        if !emulator.check_caps() {
            warn!("TPM backend does not implement the minimum required capabilities");
            emulator.had_startup_error = true;
        }

        let data_fd = emulator.data_fd;
        let worker_queue = emulator.queue.clone();
        emulator._worker = Some(
            thread::Builder::new()
                .name("tpm-transfer".to_string())
                .spawn(move || Emulator::run_worker(data_fd, cmd_rx, worker_queue))
                .map_err(|e| {
                    Error::InitializeEmulator(anyhow!("Failed to spawn transfer worker: {e}"))
                })?,
        );

        Ok(emulator)
    }

    /// Create a socketpair, pass one end to swtpm as its data channel via
    /// the CmdSetDatafd control command and keep the other end for the
    /// transfer worker.
    fn prepare_data_fd(&mut self) -> Result<()> {
        let mut fds = [-1, -1];
        // SAFETY: FFI call and the return value of the unsafe call is checked
        unsafe {
            let ret = libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr());
            if ret == -1 {
                return Err(Error::PrepareDataFd(anyhow!(
                    "Failed to create socketpair: {:?}",
                    std::io::Error::last_os_error()
                )));
            }
        }
        self.control_socket.set_msgfd(fds[1]);
        debug!("data fd to be configured in swtpm = {:?}", fds[1]);
        self.run_control_cmd(Commands::CmdSetDatafd, &[], mem::size_of::<u32>())?;
        self.data_fd = fds[0];
        Ok(())
    }

    /// Gather TPM capabilities and cache them.
    fn probe_caps(&mut self) -> Result<()> {
        let resp = self.run_control_cmd(Commands::CmdGetCapability, &[], mem::size_of::<u64>())?;
        self.caps = ctrl::parse_capabilities(&resp)
            .map_err(|e| Error::RunControlCmd(anyhow!("{e}")))?;
        debug!("TPM backend capabilities: {:#x}", self.caps);
        Ok(())
    }

    /// Check if the minimum set of capabilities for a TPM 2.0 is supported.
    fn check_caps(&self) -> bool {
        let caps: u64 = PTM_CAP_INIT
            | PTM_CAP_SHUTDOWN
            | PTM_CAP_GET_TPMESTABLISHED
            | PTM_CAP_SET_LOCALITY
            | PTM_CAP_RESET_TPMESTABLISHED
            | PTM_CAP_SET_DATAFD
            | PTM_CAP_STOP
            | PTM_CAP_SET_BUFFERSIZE;

        (self.caps & caps) == caps
    }

    /// Run a control command and return its raw response, once the leading
    /// result code has been verified.
    ///
    /// # Arguments
    ///
    /// * `cmd` - Control command to run
    /// * `payload` - Marshalled request body, if the command takes one
    /// * `want_out` - Length of the expected response in bytes
    fn run_control_cmd(
        &mut self,
        cmd: Commands,
        payload: &[u8],
        want_out: usize,
    ) -> Result<Vec<u8>> {
        debug!("Control command to send: {cmd:?}");

        let buf = ctrl::encode_request(cmd, payload);
        let written = self.control_socket.write(&buf).map_err(|e| {
            Error::RunControlCmd(anyhow!("Failed while running {cmd:?} control command: {e:?}"))
        })?;
        if written < buf.len() {
            return Err(Error::RunControlCmd(anyhow!(
                "Truncated write while running {cmd:?} control command"
            )));
        }

        // The largest response is 16 bytes so far.
        let mut output = [0u8; 16];
        if want_out > output.len() {
            return Err(Error::RunControlCmd(anyhow!(
                "Response size is too large for {cmd:?}, max 16 wanted {want_out}"
            )));
        }

        let read_size = self.control_socket.read(&mut output).map_err(|e| {
            Error::RunControlCmd(anyhow!(
                "Failed while reading response for control command {cmd:?}: {e:?}"
            ))
        })?;
        if read_size < want_out {
            return Err(Error::RunControlCmd(anyhow!(
                "Truncated response for {cmd:?}: got {read_size} bytes, expected {want_out}"
            )));
        }

        let res = ctrl::parse_result(&output[..read_size])
            .map_err(|e| Error::RunControlCmd(anyhow!("{e}")))?;
        if res != TPM_SUCCESS {
            return Err(Error::RunControlCmd(anyhow!(
                "Control command {cmd:?} returned error code: {res}"
            )));
        }
        debug!("Control command response: {:02X?}", &output[..read_size]);
        Ok(output[..read_size].to_vec())
    }

    /// Negotiate the buffer size with swtpm. A `wanted_size` of 0 queries
    /// the current size. The TPM must be stopped for the exchange.
    fn set_buffer_size(&mut self, wanted_size: usize) -> Result<usize> {
        self.stop_tpm()?;

        let payload = (wanted_size as u32).to_be_bytes();
        let resp = self.run_control_cmd(
            Commands::CmdSetBufferSize,
            &payload,
            4 * mem::size_of::<u32>(),
        )?;
        let sizes = ctrl::parse_buffer_sizes(&resp)
            .map_err(|e| Error::RunControlCmd(anyhow!("{e}")))?;

        Ok(sizes.bufsize as usize)
    }

    fn startup_tpm(&mut self, buffer_size: usize) -> Result<()> {
        if buffer_size != 0 {
            let actual_size = self.set_buffer_size(buffer_size)?;
            debug!("Set TPM buffer size to {actual_size:?} during startup");
        }

        let init_flags = 0u32.to_be_bytes();
        self.run_control_cmd(Commands::CmdInit, &init_flags, mem::size_of::<u32>())?;

        Ok(())
    }

    fn stop_tpm(&mut self) -> Result<()> {
        self.run_control_cmd(Commands::CmdStop, &[], mem::size_of::<u32>())?;
        Ok(())
    }

    fn run_worker(data_fd: RawFd, cmds: Receiver<BackendCmd>, queue: Arc<CompletionQueue>) {
        while let Ok(cmd) = cmds.recv() {
            let completion = Self::transfer(data_fd, cmd);
            queue.completions.lock().unwrap().push_back(completion);
            if let Err(e) = queue.notifier.write(1) {
                error!("Failed to signal a TPM completion: {e}");
            }
        }
    }

    /// Write a command to the data channel and block for the response.
    fn transfer(data_fd: RawFd, cmd: BackendCmd) -> BackendCompletion {
        let selftest = is_selftest(&cmd.input);

        debug!(
            "Send command of len {:?} from locality {} on the data channel",
            cmd.input.len(),
            cmd.locty
        );

        let data_vecs = [libc::iovec {
            iov_base: cmd.input.as_ptr() as *mut c_void,
            iov_len: cmd.input.len(),
        }; 1];
        // SAFETY: all zero values from the unsafe method are updated before usage
        let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
        msghdr.msg_name = ptr::null_mut();
        msghdr.msg_namelen = 0;
        msghdr.msg_iov = data_vecs.as_ptr() as *mut libc::iovec;
        msghdr.msg_iovlen = data_vecs.len() as _;
        msghdr.msg_control = ptr::null_mut();
        msghdr.msg_controllen = 0;
        msghdr.msg_flags = 0;
        // SAFETY: FFI call and the return value of the unsafe method is checked
        unsafe {
            let ret = libc::sendmsg(data_fd, &msghdr, 0);
            if ret == -1 {
                error!(
                    "Failed to send TPM command over the data channel: {:?}",
                    std::io::Error::last_os_error()
                );
                return BackendCompletion {
                    locty: cmd.locty,
                    output: Vec::new(),
                    ret: TPM_FAIL,
                    selftest_done: false,
                };
            }
        }

        let mut output = vec![0u8; cmd.output_cap];
        // SAFETY: type "sockaddr_storage" is valid with an all-zero byte-pattern value
        let mut addr: sockaddr_storage = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<sockaddr_storage>() as socklen_t;
        let output_len;
        // SAFETY: FFI call and the return value of the unsafe method is checked
        unsafe {
            let ret = libc::recvfrom(
                data_fd,
                output.as_mut_ptr() as *mut c_void,
                output.len(),
                0,
                &mut addr as *mut sockaddr_storage as *mut libc::sockaddr,
                &mut addr_len as *mut socklen_t,
            );
            if ret == -1 {
                error!(
                    "Failed to receive a TPM response over the data channel: {:?}",
                    std::io::Error::last_os_error()
                );
                return BackendCompletion {
                    locty: cmd.locty,
                    output: Vec::new(),
                    ret: TPM_FAIL,
                    selftest_done: false,
                };
            }
            output_len = ret as usize;
        }
        output.truncate(output_len);
        debug!("TPM response of len {output_len:?}, selftest = {selftest:?}");

        let mut selftest_done = false;
        if selftest && output.len() >= TPM_REQ_HDR_SIZE {
            let errcode: [u8; 4] = output[6..10]
                .try_into()
                .expect("slice with incorrect length");
            selftest_done = u32::from_be_bytes(errcode) == 0;
        }

        BackendCompletion {
            locty: cmd.locty,
            output,
            ret: TPM_SUCCESS,
            selftest_done,
        }
    }
}

impl TpmBackend for Emulator {
    fn tpm_version(&self) -> TpmVersion {
        if self.had_startup_error {
            return TpmVersion::Unspec;
        }
        // The required capability set is the TPM 2.0 one.
        TpmVersion::Tpm20
    }

    fn buffer_size(&mut self) -> usize {
        self.set_buffer_size(0).unwrap_or(TPM_BUFFER_MAX)
    }

    fn had_startup_error(&self) -> bool {
        self.had_startup_error
    }

    fn reset(&mut self) {
        self.queue.completions.lock().unwrap().clear();
        self.had_startup_error = false;
    }

    fn startup(&mut self, buffer_size: usize) {
        if let Err(e) = self.startup_tpm(buffer_size) {
            error!("Failed to start up the TPM: {e}");
            self.had_startup_error = true;
        }
    }

    fn deliver_request(&mut self, cmd: BackendCmd) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|e| BackendError::DeliverRequest(anyhow!("Transfer worker is gone: {e}")))
    }

    fn cancel_cmd(&mut self) {
        // Some backends do not support it.
        if (self.caps & PTM_CAP_CANCEL_TPM_CMD) != PTM_CAP_CANCEL_TPM_CMD {
            warn!("TPM backend does not implement the 'Cancel Command' capability");
            return;
        }
        if let Err(e) = self.run_control_cmd(Commands::CmdCancelTpmCmd, &[], mem::size_of::<u32>())
        {
            error!("Failed to cancel the in-flight TPM command: {e}");
        }
    }

    fn get_established_flag(&mut self) -> bool {
        if let Some(flag) = self.established_flag {
            return flag;
        }

        let resp = match self.run_control_cmd(
            Commands::CmdGetTpmEstablished,
            &[],
            2 * mem::size_of::<u32>(),
        ) {
            Ok(resp) => resp,
            Err(e) => {
                error!("Failed to run CmdGetTpmEstablished control command: {e}");
                return false;
            }
        };
        let flag = match ctrl::parse_established(&resp) {
            Ok(flag) => flag,
            Err(e) => {
                error!("Malformed CmdGetTpmEstablished response: {e}");
                return false;
            }
        };

        self.established_flag = Some(flag);
        flag
    }

    fn reset_established_flag(&mut self, locty: u8) -> crate::Result<()> {
        self.run_control_cmd(
            Commands::CmdResetTpmEstablished,
            &[locty],
            mem::size_of::<u32>(),
        )
        .map_err(|e| BackendError::ControlCmd(anyhow!("{e}")))?;
        // Query swtpm again next time the flag is needed.
        self.established_flag = None;
        Ok(())
    }

    fn next_completion(&mut self) -> Option<BackendCompletion> {
        self.queue.completions.lock().unwrap().pop_front()
    }

    fn completion_notifier(&self) -> Option<EventFd> {
        self.queue.notifier.try_clone().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_selftest() {
        let mut cmd = [0u8; 12];
        cmd[6..10].copy_from_slice(&0x143u32.to_be_bytes());
        assert!(is_selftest(&cmd));

        cmd[6..10].copy_from_slice(&0x144u32.to_be_bytes());
        assert!(!is_selftest(&cmd));

        // Short buffers never qualify.
        assert!(!is_selftest(&[0x80, 0x01, 0x00]));
    }
}
