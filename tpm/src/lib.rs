// Copyright © 2022, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

pub mod ctrl;
pub mod emulator;
pub mod socket;

use std::result;

use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

/// Largest command/response buffer ever negotiated with a backend. The
/// device clamps whatever the backend offers to this value.
pub const TPM_BUFFER_MAX: usize = 4096;

/// Return code of a TPM command that completed successfully.
pub const TPM_SUCCESS: u32 = 0;
/// Generic TPM failure code, reported when the transport itself broke down.
pub const TPM_FAIL: u32 = 9;

/// Family of the TPM behind the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TpmVersion {
    #[default]
    Unspec,
    Tpm12,
    Tpm20,
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to run a control command on the TPM backend: {0}")]
    ControlCmd(#[source] anyhow::Error),
    #[error("Failed to deliver a command to the TPM backend: {0}")]
    DeliverRequest(#[source] anyhow::Error),
}
pub type Result<T> = result::Result<T, BackendError>;

/// A command handed over to the backend for execution.
///
/// The response comes back asynchronously as a [`BackendCompletion`]; at
/// most one command is in flight at any time.
#[derive(Debug, Clone)]
pub struct BackendCmd {
    /// Locality the command was issued from.
    pub locty: u8,
    /// Marshalled TPM command, header included.
    pub input: Vec<u8>,
    /// Largest response the requester is able to accept.
    pub output_cap: usize,
}

/// Outcome of an executed [`BackendCmd`].
#[derive(Debug, Clone)]
pub struct BackendCompletion {
    pub locty: u8,
    /// Raw response, delivered verbatim even if it encodes a TPM error.
    pub output: Vec<u8>,
    pub ret: u32,
    /// The command was a self test and it passed.
    pub selftest_done: bool,
}

/// Contract between the TIS frontend and a TPM implementation.
///
/// All calls are made from the device's serialized context and must not
/// block: `deliver_request` hands the command to the backend and returns,
/// the response is later drained through `next_completion` once
/// `completion_notifier` fires.
pub trait TpmBackend: Send {
    fn tpm_version(&self) -> TpmVersion;

    /// Preferred command/response buffer size. Queried once per reset.
    fn buffer_size(&mut self) -> usize;

    /// Whether the last `startup` failed. While set, the frontend turns
    /// itself off (reads return 0, writes are dropped).
    fn had_startup_error(&self) -> bool;

    /// Drop any in-flight work and clear the startup-error latch.
    fn reset(&mut self);

    /// (Re)initialize the TPM with the negotiated buffer size.
    fn startup(&mut self, buffer_size: usize);

    /// Hand a command over for execution. Returns immediately.
    fn deliver_request(&mut self, cmd: BackendCmd) -> Result<()>;

    /// Best-effort cancellation of the in-flight command. Backends that
    /// cannot cancel let the command run to completion.
    fn cancel_cmd(&mut self);

    fn get_established_flag(&mut self) -> bool;

    /// Clear the TPM established flag on behalf of `locty`.
    fn reset_established_flag(&mut self, locty: u8) -> Result<()>;

    /// Drain one completed command, if any.
    fn next_completion(&mut self) -> Option<BackendCompletion>;

    /// Event signaled whenever a completion is queued.
    fn completion_notifier(&self) -> Option<EventFd>;
}
