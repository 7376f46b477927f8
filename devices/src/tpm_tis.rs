// Copyright © 2022, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! TPM TIS FIFO interface emulator.
//!
//! Exposes the register file defined by the TCG PC Client specifications
//! (TIS 1.3 for a TPM 1.2 backend, the PTP FIFO interface for a TPM 2.0
//! backend): five 4 KiB locality pages with identical layouts, backed by a
//! single shared command/response buffer. Commands assembled through the
//! FIFO are handed to an out-of-process TPM backend; its completion is
//! applied from the device's serialized context via `request_completed`.

use std::cmp;
use std::sync::{Arc, Barrier};

use thiserror::Error;
use tpm::{BackendCmd, BackendCompletion, TpmBackend, TpmVersion};
use vm_device::interrupt::InterruptSourceGroup;
use vm_device::BusDevice;
use vmm_sys_util::eventfd::EventFd;

pub const TPM_TIS_NUM_LOCALITIES: u8 = 5;
const TPM_TIS_LOCALITY_SHIFT: u64 = 12;
/// Size of the MMIO window: one 4 KiB register page per locality.
pub const TPM_TIS_MMIO_SIZE: u64 = (TPM_TIS_NUM_LOCALITIES as u64) << TPM_TIS_LOCALITY_SHIFT;

const TPM_TIS_BUFFER_MAX: usize = 4096;
const TPM_TIS_NO_DATA_BYTE: u8 = 0xff;

/* register offsets within a locality page */
const TPM_TIS_REG_ACCESS: u64 = 0x00;
const TPM_TIS_REG_INT_ENABLE: u64 = 0x08;
const TPM_TIS_REG_INT_VECTOR: u64 = 0x0c;
const TPM_TIS_REG_INT_STATUS: u64 = 0x10;
const TPM_TIS_REG_INTF_CAPABILITY: u64 = 0x14;
const TPM_TIS_REG_STS: u64 = 0x18;
const TPM_TIS_REG_DATA_FIFO: u64 = 0x24;
const TPM_TIS_REG_INTERFACE_ID: u64 = 0x30;
const TPM_TIS_REG_DATA_XFIFO: u64 = 0x80;
const TPM_TIS_REG_DATA_XFIFO_END: u64 = 0xbc;
const TPM_TIS_REG_DID_VID: u64 = 0xf00;
const TPM_TIS_REG_RID: u64 = 0xf04;

/* ACCESS register flags */
const TPM_TIS_ACCESS_TPM_ESTABLISHMENT: u8 = 1 << 0;
const TPM_TIS_ACCESS_REQUEST_USE: u8 = 1 << 1;
const TPM_TIS_ACCESS_PENDING_REQUEST: u8 = 1 << 2;
const TPM_TIS_ACCESS_SEIZE: u8 = 1 << 3;
const TPM_TIS_ACCESS_BEEN_SEIZED: u8 = 1 << 4;
const TPM_TIS_ACCESS_ACTIVE_LOCALITY: u8 = 1 << 5;
const TPM_TIS_ACCESS_TPM_REG_VALID_STS: u8 = 1 << 7;

/* STS register flags */
const TPM_TIS_STS_RESPONSE_RETRY: u32 = 1 << 1;
const TPM_TIS_STS_SELFTEST_DONE: u32 = 1 << 2;
const TPM_TIS_STS_EXPECT: u32 = 1 << 3;
const TPM_TIS_STS_DATA_AVAILABLE: u32 = 1 << 4;
const TPM_TIS_STS_TPM_GO: u32 = 1 << 5;
const TPM_TIS_STS_COMMAND_READY: u32 = 1 << 6;
const TPM_TIS_STS_VALID: u32 = 1 << 7;
/* TPM 2.0 additions to STS */
const TPM_TIS_STS_COMMAND_CANCEL: u32 = 1 << 24;
const TPM_TIS_STS_RESET_ESTABLISHMENT_BIT: u32 = 1 << 25;
const TPM_TIS_STS_TPM_FAMILY_MASK: u32 = 0x3 << 26;
const TPM_TIS_STS_TPM_FAMILY1_2: u32 = 0 << 26;
const TPM_TIS_STS_TPM_FAMILY2_0: u32 = 1 << 26;

const TPM_TIS_BURST_COUNT_SHIFT: u32 = 8;

/* INT_ENABLE/INT_STATUS register flags */
const TPM_TIS_INT_DATA_AVAILABLE: u32 = 1 << 0;
const TPM_TIS_INT_STS_VALID: u32 = 1 << 1;
const TPM_TIS_INT_LOCALITY_CHANGED: u32 = 1 << 2;
const TPM_TIS_INT_COMMAND_READY: u32 = 1 << 7;
const TPM_TIS_INT_POLARITY_MASK: u32 = 3 << 3;
const TPM_TIS_INT_POLARITY_LOW_LEVEL: u32 = 1 << 3;
const TPM_TIS_INT_ENABLED: u32 = 1 << 31;

const TPM_TIS_INTERRUPTS_SUPPORTED: u32 = TPM_TIS_INT_LOCALITY_CHANGED
    | TPM_TIS_INT_DATA_AVAILABLE
    | TPM_TIS_INT_STS_VALID
    | TPM_TIS_INT_COMMAND_READY;

/* INTF_CAPABILITY fields */
const TPM_TIS_CAP_INTERFACE_VERSION1_3: u32 = 2 << 28;
const TPM_TIS_CAP_INTERFACE_VERSION1_3_FOR_TPM2_0: u32 = 3 << 28;
const TPM_TIS_CAP_DATA_TRANSFER_64B: u32 = 3 << 9;
const TPM_TIS_CAP_BURST_COUNT_DYNAMIC: u32 = 0 << 8;
/* support for the low level interrupt is mandatory */
const TPM_TIS_CAP_INTERRUPT_LOW_LEVEL: u32 = 1 << 4;

const TPM_TIS_CAPABILITIES_SUPPORTED1_3: u32 = TPM_TIS_CAP_INTERRUPT_LOW_LEVEL
    | TPM_TIS_CAP_BURST_COUNT_DYNAMIC
    | TPM_TIS_CAP_DATA_TRANSFER_64B
    | TPM_TIS_CAP_INTERFACE_VERSION1_3
    | TPM_TIS_INTERRUPTS_SUPPORTED;

const TPM_TIS_CAPABILITIES_SUPPORTED2_0: u32 = TPM_TIS_CAP_INTERRUPT_LOW_LEVEL
    | TPM_TIS_CAP_BURST_COUNT_DYNAMIC
    | TPM_TIS_CAP_DATA_TRANSFER_64B
    | TPM_TIS_CAP_INTERFACE_VERSION1_3_FOR_TPM2_0
    | TPM_TIS_INTERRUPTS_SUPPORTED;

/* INTERFACE_ID fields (TPM 2.0) */
const TPM_TIS_IFACE_ID_INTERFACE_TIS1_3: u32 = 0xf;
const TPM_TIS_IFACE_ID_INTERFACE_FIFO: u32 = 0x0;
const TPM_TIS_IFACE_ID_INTERFACE_VER_FIFO: u32 = 0 << 4;
const TPM_TIS_IFACE_ID_CAP_5_LOCALITIES: u32 = 1 << 8;
const TPM_TIS_IFACE_ID_CAP_TIS_SUPPORTED: u32 = 1 << 13;
const TPM_TIS_IFACE_ID_INT_SEL_LOCK: u32 = 1 << 19;

/* a TIS 1.3 interface: everything past the interface type is don't care */
const TPM_TIS_IFACE_ID_SUPPORTED_FLAGS1_3: u32 =
    TPM_TIS_IFACE_ID_INTERFACE_TIS1_3 | (!0u32 << 4);

const TPM_TIS_IFACE_ID_SUPPORTED_FLAGS2_0: u32 = TPM_TIS_IFACE_ID_INTERFACE_FIFO
    | TPM_TIS_IFACE_ID_INTERFACE_VER_FIFO
    | TPM_TIS_IFACE_ID_CAP_5_LOCALITIES
    | TPM_TIS_IFACE_ID_CAP_TIS_SUPPORTED;

const TPM_TIS_TPM_DID: u32 = 0x0001;
const TPM_TIS_TPM_VID: u32 = 0x1014;
const TPM_TIS_TPM_RID: u32 = 0x0001;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IRQ {0} is outside the valid range of 0 to 15")]
    IrqOutOfRange(u32),
}
type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum TpmTisState {
    #[default]
    Idle,
    Ready,
    Completion,
    Execution,
    Reception,
}

#[derive(Default)]
struct Locality {
    state: TpmTisState,
    access: u8,
    sts: u32,
    iface_id: u32,
    inte: u32,
    ints: u32,
}

impl Locality {
    /// Replace the status flags, preserving the sticky SELFTEST_DONE bit
    /// and the TPM family field.
    fn set_sts(&mut self, flags: u32) {
        self.sts &= TPM_TIS_STS_SELFTEST_DONE | TPM_TIS_STS_TPM_FAMILY_MASK;
        self.sts |= flags;
    }
}

/// Backend request in flight; present from TPM_GO until the completion.
struct ActiveCommand {
    locty: u8,
}

pub struct TpmTis {
    backend: Box<dyn TpmBackend>,
    interrupt: Arc<Box<dyn InterruptSourceGroup>>,
    irq_num: u32,

    loc: [Locality; TPM_TIS_NUM_LOCALITIES as usize],
    active_locty: Option<u8>,
    next_locty: Option<u8>,
    aborting_locty: Option<u8>,

    buffer: [u8; TPM_TIS_BUFFER_MAX],
    rw_offset: u16,
    cmd: Option<ActiveCommand>,

    be_buffer_size: usize,
    be_tpm_version: TpmVersion,
}

fn locality_from_addr(addr: u64) -> u8 {
    ((addr >> TPM_TIS_LOCALITY_SHIFT) & 0x7) as u8
}

fn is_valid_locty(locty: u8) -> bool {
    locty < TPM_TIS_NUM_LOCALITIES
}

fn burst_count(count: u32) -> u32 {
    count << TPM_TIS_BURST_COUNT_SHIFT
}

impl TpmTis {
    pub fn new(
        backend: Box<dyn TpmBackend>,
        interrupt: Arc<Box<dyn InterruptSourceGroup>>,
        irq_num: u32,
    ) -> Result<Self> {
        if irq_num > 15 {
            return Err(Error::IrqOutOfRange(irq_num));
        }

        let mut tpm = Self {
            backend,
            interrupt,
            irq_num,
            loc: Default::default(),
            active_locty: None,
            next_locty: None,
            aborting_locty: None,
            buffer: [0; TPM_TIS_BUFFER_MAX],
            rw_offset: 0,
            cmd: None,
            be_buffer_size: 0,
            be_tpm_version: TpmVersion::Unspec,
        };
        tpm.reset();
        Ok(tpm)
    }

    /// Bring the device back to its power-on state. Called at construction
    /// and on every machine reset.
    pub fn reset(&mut self) {
        self.be_tpm_version = self.backend.tpm_version();
        self.be_buffer_size = cmp::min(self.backend.buffer_size(), TPM_TIS_BUFFER_MAX);
        self.backend.reset();

        self.active_locty = None;
        self.next_locty = None;
        self.aborting_locty = None;
        self.rw_offset = 0;
        self.cmd = None;

        for l in self.loc.iter_mut() {
            l.access = TPM_TIS_ACCESS_TPM_REG_VALID_STS;
            match self.be_tpm_version {
                TpmVersion::Unspec => {}
                TpmVersion::Tpm12 => {
                    l.sts = TPM_TIS_STS_TPM_FAMILY1_2;
                    l.iface_id = TPM_TIS_IFACE_ID_SUPPORTED_FLAGS1_3;
                }
                TpmVersion::Tpm20 => {
                    l.sts = TPM_TIS_STS_TPM_FAMILY2_0;
                    l.iface_id = TPM_TIS_IFACE_ID_SUPPORTED_FLAGS2_0;
                }
            }
            l.inte = TPM_TIS_INT_POLARITY_LOW_LEVEL;
            l.ints = 0;
            l.state = TpmTisState::Idle;
        }

        self.backend.startup(self.be_buffer_size);
    }

    /// Event signaled by the backend whenever a completion is ready to be
    /// drained through `process_backend_completions`.
    pub fn completion_notifier(&self) -> Option<EventFd> {
        self.backend.completion_notifier()
    }

    /// Apply all queued backend completions. The platform calls this from
    /// the device's serialized context once the completion notifier fires.
    pub fn process_backend_completions(&mut self) {
        while let Some(completion) = self.backend.next_completion() {
            self.request_completed(completion);
        }
    }

    /// Apply the response of the command submitted through TPM_GO.
    ///
    /// The backend return code is not surfaced through TIS; the response
    /// payload is delivered verbatim even when it encodes a TPM error.
    pub fn request_completed(&mut self, completion: BackendCompletion) {
        let Some(cmd) = self.cmd.take() else {
            warn!("TPM backend completion without an in-flight command");
            return;
        };
        let locty = cmd.locty;

        let len = cmp::min(completion.output.len(), self.be_buffer_size);
        self.buffer[..len].copy_from_slice(&completion.output[..len]);

        if completion.selftest_done {
            for l in self.loc.iter_mut() {
                l.sts |= TPM_TIS_STS_SELFTEST_DONE;
            }
        }

        self.loc[usize::from(locty)].set_sts(TPM_TIS_STS_VALID | TPM_TIS_STS_DATA_AVAILABLE);
        self.loc[usize::from(locty)].state = TpmTisState::Completion;
        self.rw_offset = 0;

        if self.next_locty.is_some() {
            // An abort was waiting for this command to finish.
            self.abort();
        }

        self.raise_irq(locty, TPM_TIS_INT_DATA_AVAILABLE | TPM_TIS_INT_STS_VALID);
    }

    /// Total command size encoded in the buffer header, in bytes.
    fn tpm_cmd_size(&self) -> usize {
        u32::from_be_bytes([
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
            self.buffer[5],
        ]) as usize
    }

    fn raise_irq(&mut self, locty: u8, irqmask: u32) {
        if !is_valid_locty(locty) {
            return;
        }

        let l = &mut self.loc[usize::from(locty)];
        if (l.inte & TPM_TIS_INT_ENABLED) != 0 && (l.inte & irqmask) != 0 {
            debug!("Raising IRQ for flag {irqmask:08x}");
            if let Err(e) = self.interrupt.trigger(0) {
                error!("Failed to trigger interrupt: {e}");
            }
            l.ints |= irqmask;
        }
    }

    fn lower_irq(&mut self) {
        debug!("Lowering IRQ");
        if let Err(e) = self.interrupt.untrigger(0) {
            error!("Failed to deassert interrupt: {e}");
        }
    }

    /// Whether any locality other than `locty` has a pending use request.
    fn check_request_use_except(&self, locty: u8) -> bool {
        self.loc
            .iter()
            .enumerate()
            .any(|(l, loc)| l != usize::from(locty) && loc.access & TPM_TIS_ACCESS_REQUEST_USE != 0)
    }

    fn new_active_locality(&mut self, new_active_locty: Option<u8>) {
        let change = self.active_locty != new_active_locty;

        if change {
            if let Some(old) = self.active_locty {
                let is_seize = new_active_locty
                    .is_some_and(|new| self.loc[usize::from(new)].access & TPM_TIS_ACCESS_SEIZE != 0);

                // Reset flags on the old active locality. On a seize the
                // victim keeps its use request and learns what happened.
                if is_seize {
                    self.loc[usize::from(old)].access &= !TPM_TIS_ACCESS_ACTIVE_LOCALITY;
                    self.loc[usize::from(old)].access |= TPM_TIS_ACCESS_BEEN_SEIZED;
                } else {
                    self.loc[usize::from(old)].access &=
                        !(TPM_TIS_ACCESS_ACTIVE_LOCALITY | TPM_TIS_ACCESS_REQUEST_USE);
                }
            }
        }

        self.active_locty = new_active_locty;
        debug!("Active locality is now {:?}", self.active_locty);

        if let Some(new) = new_active_locty {
            self.loc[usize::from(new)].access |= TPM_TIS_ACCESS_ACTIVE_LOCALITY;
            self.loc[usize::from(new)].access &=
                !(TPM_TIS_ACCESS_REQUEST_USE | TPM_TIS_ACCESS_SEIZE);
        }

        if change {
            if let Some(new) = self.active_locty {
                self.raise_irq(new, TPM_TIS_INT_LOCALITY_CHANGED);
            }
        }
    }

    /// Complete a pending locality switch.
    fn abort(&mut self) {
        self.rw_offset = 0;

        debug!("Abort: new active locality is {:?}", self.next_locty);

        // A self-abort comes from COMMAND_READY and leaves the locality
        // ready for the next command.
        if let (Some(aborting), Some(next)) = (self.aborting_locty, self.next_locty) {
            if aborting == next {
                self.loc[usize::from(aborting)].state = TpmTisState::Ready;
                self.loc[usize::from(aborting)].set_sts(TPM_TIS_STS_COMMAND_READY);
                self.raise_irq(aborting, TPM_TIS_INT_COMMAND_READY);
            }
        }

        self.new_active_locality(self.next_locty);

        self.aborting_locty = None;
        self.next_locty = None;
    }

    /// Start a locality switch away from `locty`. If a command is executing
    /// the switch is deferred until its completion arrives; the backend is
    /// merely asked to cancel.
    fn prep_abort(&mut self, locty: Option<u8>, new_locty: Option<u8>) {
        self.aborting_locty = locty;
        self.next_locty = new_locty;

        if self
            .loc
            .iter()
            .any(|l| l.state == TpmTisState::Execution)
        {
            // Some backends may not support cancellation; the abort then
            // waits for the natural completion.
            self.backend.cancel_cmd();
            return;
        }

        self.abort();
    }

    /// Hand the assembled command over to the backend.
    fn tpm_send(&mut self, locty: u8) {
        self.loc[usize::from(locty)].state = TpmTisState::Execution;

        let cmd = BackendCmd {
            locty,
            input: self.buffer[..usize::from(self.rw_offset)].to_vec(),
            output_cap: self.be_buffer_size,
        };
        self.cmd = Some(ActiveCommand { locty });

        if let Err(e) = self.backend.deliver_request(cmd) {
            error!("Failed to deliver TPM command to the backend: {e}");
        }
    }

    /// Read one byte of response data.
    fn data_read(&mut self, locty: u8) -> u8 {
        if self.loc[usize::from(locty)].sts & TPM_TIS_STS_DATA_AVAILABLE == 0 {
            return TPM_TIS_NO_DATA_BYTE;
        }

        let len = cmp::min(self.tpm_cmd_size(), self.be_buffer_size);
        let Some(&ret) = self.buffer.get(usize::from(self.rw_offset)) else {
            return TPM_TIS_NO_DATA_BYTE;
        };
        self.rw_offset += 1;
        if usize::from(self.rw_offset) >= len {
            // Got the last byte.
            self.loc[usize::from(locty)].set_sts(TPM_TIS_STS_VALID);
            self.raise_irq(locty, TPM_TIS_INT_STS_VALID);
        }
        ret
    }

    fn mmio_read(&mut self, addr: u64, size: usize) -> u32 {
        let locty = locality_from_addr(addr);
        let offset = addr & 0xffc;
        let mut shift = (addr & 0x3) * 8;
        let mut val: u32 = 0xffff_ffff;

        if !is_valid_locty(locty) {
            return val;
        }
        if self.backend.had_startup_error() {
            return 0;
        }

        match offset {
            TPM_TIS_REG_ACCESS => {
                // Never show the SEIZE flag even though it is used
                // internally.
                val = u32::from(self.loc[usize::from(locty)].access & !TPM_TIS_ACCESS_SEIZE);
                if self.check_request_use_except(locty) {
                    val |= u32::from(TPM_TIS_ACCESS_PENDING_REQUEST);
                }
                if !self.backend.get_established_flag() {
                    val |= u32::from(TPM_TIS_ACCESS_TPM_ESTABLISHMENT);
                }
            }
            TPM_TIS_REG_INT_ENABLE => val = self.loc[usize::from(locty)].inte,
            TPM_TIS_REG_INT_VECTOR => val = self.irq_num,
            TPM_TIS_REG_INT_STATUS => val = self.loc[usize::from(locty)].ints,
            TPM_TIS_REG_INTF_CAPABILITY => {
                val = match self.be_tpm_version {
                    TpmVersion::Unspec => 0,
                    TpmVersion::Tpm12 => TPM_TIS_CAPABILITIES_SUPPORTED1_3,
                    TpmVersion::Tpm20 => TPM_TIS_CAPABILITIES_SUPPORTED2_0,
                };
            }
            TPM_TIS_REG_STS => {
                val = 0;
                if self.active_locty == Some(locty) {
                    let sts = self.loc[usize::from(locty)].sts;
                    val = if sts & TPM_TIS_STS_DATA_AVAILABLE != 0 {
                        let len = cmp::min(self.tpm_cmd_size(), self.be_buffer_size);
                        let avail = len.saturating_sub(usize::from(self.rw_offset));
                        burst_count(avail as u32) | sts
                    } else {
                        let mut avail = self.be_buffer_size.saturating_sub(usize::from(self.rw_offset));
                        // Byte-sized reads should not return 0x00 for 0x100
                        // available bytes.
                        if size == 1 && avail > 0xff {
                            avail = 0xff;
                        }
                        burst_count(avail as u32) | sts
                    };
                }
            }
            o if o == TPM_TIS_REG_DATA_FIFO
                || (TPM_TIS_REG_DATA_XFIFO..=TPM_TIS_REG_DATA_XFIFO_END).contains(&o) =>
            {
                if self.active_locty == Some(locty) {
                    // Prevent access beyond the FIFO.
                    let size = cmp::min(size, 4 - (addr & 0x3) as usize);
                    val = 0;
                    for lane in 0..size {
                        let v = match self.loc[usize::from(locty)].state {
                            TpmTisState::Completion => self.data_read(locty),
                            _ => TPM_TIS_NO_DATA_BYTE,
                        };
                        val |= u32::from(v) << (lane * 8);
                    }
                    shift = 0;
                }
            }
            TPM_TIS_REG_INTERFACE_ID => val = self.loc[usize::from(locty)].iface_id,
            TPM_TIS_REG_DID_VID => val = (TPM_TIS_TPM_DID << 16) | TPM_TIS_TPM_VID,
            TPM_TIS_REG_RID => val = TPM_TIS_TPM_RID,
            _ => {}
        }

        if shift != 0 {
            val >>= shift;
        }

        val
    }

    fn mmio_write(&mut self, addr: u64, mut val: u32, size: usize) {
        let locty = locality_from_addr(addr);
        let off = addr & 0xffc;
        let shift = (addr & 0x3) * 8;
        let mut mask: u32 = match size {
            1 => 0xff,
            2 => 0xffff,
            _ => !0,
        };

        if locty == 4 {
            debug!("Access to locality 4 only allowed from hardware");
            return;
        }
        if !is_valid_locty(locty) {
            return;
        }
        if self.backend.had_startup_error() {
            return;
        }

        val &= mask;
        if shift != 0 {
            val <<= shift;
            mask <<= shift;
        }
        // Bits outside the access window are preserved.
        mask = !mask;

        match off {
            TPM_TIS_REG_ACCESS => {
                if val & u32::from(TPM_TIS_ACCESS_SEIZE) != 0 {
                    // Request-use and release take no effect when combined
                    // with a seize.
                    val &= !u32::from(TPM_TIS_ACCESS_REQUEST_USE | TPM_TIS_ACCESS_ACTIVE_LOCALITY);
                }

                let mut next_active = self.active_locty;
                let mut set_new_locty = true;

                if val & u32::from(TPM_TIS_ACCESS_ACTIVE_LOCALITY) != 0 {
                    if self.active_locty == Some(locty) {
                        debug!("Releasing locality {locty}");

                        // Hand over to the highest-numbered requester.
                        let mut new_locty = None;
                        for c in (0..TPM_TIS_NUM_LOCALITIES).rev() {
                            if self.loc[usize::from(c)].access & TPM_TIS_ACCESS_REQUEST_USE != 0 {
                                new_locty = Some(c);
                                break;
                            }
                        }
                        debug!("Next active locality: {new_locty:?}");

                        if new_locty.is_some() {
                            set_new_locty = false;
                            self.prep_abort(Some(locty), new_locty);
                        } else {
                            next_active = None;
                        }
                    } else {
                        // Not the owner; withdraw a pending request.
                        self.loc[usize::from(locty)].access &= !TPM_TIS_ACCESS_REQUEST_USE;
                    }
                }

                if val & u32::from(TPM_TIS_ACCESS_BEEN_SEIZED) != 0 {
                    self.loc[usize::from(locty)].access &= !TPM_TIS_ACCESS_BEEN_SEIZED;
                }

                if val & u32::from(TPM_TIS_ACCESS_SEIZE) != 0 {
                    // A seize is allowed when no locality is active, or for
                    // a locality higher than the active one, and only while
                    // no equal-or-higher seize is pending.
                    let allowed = match self.active_locty {
                        Some(active) => locty > active,
                        None => true,
                    };

                    if allowed && self.loc[usize::from(locty)].access & TPM_TIS_ACCESS_SEIZE == 0 {
                        let higher_seize = (locty + 1..TPM_TIS_NUM_LOCALITIES)
                            .any(|l| self.loc[usize::from(l)].access & TPM_TIS_ACCESS_SEIZE != 0);

                        if !higher_seize {
                            // Cancel any seize by a lower locality.
                            for l in 0..locty {
                                self.loc[usize::from(l)].access &= !TPM_TIS_ACCESS_SEIZE;
                            }

                            self.loc[usize::from(locty)].access |= TPM_TIS_ACCESS_SEIZE;
                            debug!(
                                "Locality {locty} seized from locality {:?}",
                                self.active_locty
                            );
                            set_new_locty = false;
                            self.prep_abort(self.active_locty, Some(locty));
                        }
                    }
                }

                if val & u32::from(TPM_TIS_ACCESS_REQUEST_USE) != 0
                    && self.active_locty != Some(locty)
                {
                    if self.active_locty.is_some() {
                        self.loc[usize::from(locty)].access |= TPM_TIS_ACCESS_REQUEST_USE;
                    } else {
                        // No locality active: this one becomes active now.
                        next_active = Some(locty);
                    }
                }

                if set_new_locty {
                    self.new_active_locality(next_active);
                }
            }
            TPM_TIS_REG_INT_ENABLE => {
                if self.active_locty != Some(locty) {
                    return;
                }

                let l = &mut self.loc[usize::from(locty)];
                l.inte &= mask;
                l.inte |= val
                    & (TPM_TIS_INT_ENABLED
                        | TPM_TIS_INT_POLARITY_MASK
                        | TPM_TIS_INTERRUPTS_SUPPORTED);
            }
            TPM_TIS_REG_INT_VECTOR => {
                // Hard wired; ignore.
            }
            TPM_TIS_REG_INT_STATUS => {
                if self.active_locty != Some(locty) {
                    return;
                }

                // Clearing of interrupt flags.
                let cleared = val & TPM_TIS_INTERRUPTS_SUPPORTED;
                if cleared != 0 && self.loc[usize::from(locty)].ints != 0 {
                    self.loc[usize::from(locty)].ints &= !cleared;
                    if self.loc[usize::from(locty)].ints == 0 {
                        self.lower_irq();
                    }
                }
            }
            TPM_TIS_REG_STS => {
                if self.active_locty != Some(locty) {
                    return;
                }

                if self.be_tpm_version == TpmVersion::Tpm20 {
                    if val & TPM_TIS_STS_COMMAND_CANCEL != 0
                        && self.loc[usize::from(locty)].state == TpmTisState::Execution
                    {
                        // Some backends may not support cancellation.
                        self.backend.cancel_cmd();
                    }

                    if val & TPM_TIS_STS_RESET_ESTABLISHMENT_BIT != 0 && (locty == 3 || locty == 4)
                    {
                        if let Err(e) = self.backend.reset_established_flag(locty) {
                            error!("Failed to reset the TPM established flag: {e}");
                        }
                    }
                }

                val &= TPM_TIS_STS_COMMAND_READY | TPM_TIS_STS_TPM_GO | TPM_TIS_STS_RESPONSE_RETRY;

                if val == TPM_TIS_STS_COMMAND_READY {
                    match self.loc[usize::from(locty)].state {
                        TpmTisState::Ready => self.rw_offset = 0,
                        TpmTisState::Idle => {
                            self.loc[usize::from(locty)].set_sts(TPM_TIS_STS_COMMAND_READY);
                            self.loc[usize::from(locty)].state = TpmTisState::Ready;
                            self.raise_irq(locty, TPM_TIS_INT_COMMAND_READY);
                        }
                        TpmTisState::Execution | TpmTisState::Reception => {
                            // Abort the currently running command.
                            self.prep_abort(Some(locty), Some(locty));
                        }
                        TpmTisState::Completion => {
                            self.rw_offset = 0;
                            // Shortcut to the ready state with C/R set.
                            self.loc[usize::from(locty)].state = TpmTisState::Ready;
                            if self.loc[usize::from(locty)].sts & TPM_TIS_STS_COMMAND_READY == 0 {
                                self.loc[usize::from(locty)].set_sts(TPM_TIS_STS_COMMAND_READY);
                                self.raise_irq(locty, TPM_TIS_INT_COMMAND_READY);
                            }
                            self.loc[usize::from(locty)].sts &= !TPM_TIS_STS_DATA_AVAILABLE;
                        }
                    }
                } else if val == TPM_TIS_STS_TPM_GO {
                    match self.loc[usize::from(locty)].state {
                        TpmTisState::Reception => {
                            if self.loc[usize::from(locty)].sts & TPM_TIS_STS_EXPECT == 0 {
                                self.tpm_send(locty);
                            }
                        }
                        _ => {
                            // Ignore.
                        }
                    }
                } else if val == TPM_TIS_STS_RESPONSE_RETRY {
                    match self.loc[usize::from(locty)].state {
                        TpmTisState::Completion => {
                            self.rw_offset = 0;
                            self.loc[usize::from(locty)]
                                .set_sts(TPM_TIS_STS_VALID | TPM_TIS_STS_DATA_AVAILABLE);
                        }
                        _ => {
                            // Ignore.
                        }
                    }
                }
            }
            o if o == TPM_TIS_REG_DATA_FIFO
                || (TPM_TIS_REG_DATA_XFIFO..=TPM_TIS_REG_DATA_XFIFO_END).contains(&o) =>
            {
                if self.active_locty != Some(locty) {
                    return;
                }

                match self.loc[usize::from(locty)].state {
                    TpmTisState::Idle | TpmTisState::Execution | TpmTisState::Completion => {
                        // Drop the byte.
                    }
                    TpmTisState::Ready | TpmTisState::Reception => {
                        if self.loc[usize::from(locty)].state == TpmTisState::Ready {
                            self.loc[usize::from(locty)].state = TpmTisState::Reception;
                            self.loc[usize::from(locty)]
                                .set_sts(TPM_TIS_STS_EXPECT | TPM_TIS_STS_VALID);
                        }

                        val >>= shift;
                        // Prevent access beyond the FIFO.
                        let mut size = cmp::min(size, 4 - (addr & 0x3) as usize);

                        while self.loc[usize::from(locty)].sts & TPM_TIS_STS_EXPECT != 0 && size > 0
                        {
                            if usize::from(self.rw_offset) < self.be_buffer_size {
                                self.buffer[usize::from(self.rw_offset)] = val as u8;
                                self.rw_offset += 1;
                                val >>= 8;
                                size -= 1;
                            } else {
                                // Buffer is full; the remaining bytes of
                                // this access are dropped.
                                self.loc[usize::from(locty)].set_sts(TPM_TIS_STS_VALID);
                            }
                        }

                        // Check for a complete packet.
                        if self.rw_offset > 5
                            && self.loc[usize::from(locty)].sts & TPM_TIS_STS_EXPECT != 0
                        {
                            // We have a packet length; see if we have all of it.
                            let need_irq =
                                self.loc[usize::from(locty)].sts & TPM_TIS_STS_VALID == 0;

                            if self.tpm_cmd_size() > usize::from(self.rw_offset) {
                                self.loc[usize::from(locty)]
                                    .set_sts(TPM_TIS_STS_EXPECT | TPM_TIS_STS_VALID);
                            } else {
                                // Packet complete.
                                self.loc[usize::from(locty)].set_sts(TPM_TIS_STS_VALID);
                            }
                            if need_irq {
                                self.raise_irq(locty, TPM_TIS_INT_STS_VALID);
                            }
                        }
                    }
                }
            }
            TPM_TIS_REG_INTERFACE_ID => {
                if val & TPM_TIS_IFACE_ID_INT_SEL_LOCK != 0 {
                    // The lock applies to every locality and is irrevocable.
                    for l in self.loc.iter_mut() {
                        l.iface_id |= TPM_TIS_IFACE_ID_INT_SEL_LOCK;
                    }
                }
            }
            _ => {
                debug!("Ignoring write to unsupported register {off:#x}");
            }
        }
    }
}

impl BusDevice for TpmTis {
    fn read(&mut self, _base: u64, offset: u64, data: &mut [u8]) {
        if data.len() > 4 {
            error!(
                "Invalid TPM TIS read: offset {:#x}, data length {}",
                offset,
                data.len()
            );
            return;
        }

        let val = self.mmio_read(offset, data.len());
        for (lane, byte) in data.iter_mut().enumerate() {
            *byte = (val >> (lane * 8)) as u8;
        }
        debug!("MMIO read: offset {:#x} len {} val {:#x}", offset, data.len(), val);
    }

    fn write(&mut self, _base: u64, offset: u64, data: &[u8]) -> Option<Arc<Barrier>> {
        if data.len() > 4 {
            error!(
                "Invalid TPM TIS write: offset {:#x}, data length {}",
                offset,
                data.len()
            );
            return None;
        }

        let mut raw = [0u8; 4];
        raw[..data.len()].copy_from_slice(data);
        let val = u32::from_le_bytes(raw);
        debug!("MMIO write: offset {:#x} len {} val {:#x}", offset, data.len(), val);

        self.mmio_write(offset, val, data.len());
        None
    }
}
