// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interrupt plumbing between emulated devices and the platform interrupt
//! controller.

use std::io;

use vmm_sys_util::eventfd::EventFd;

/// Index of an interrupt source within its group.
pub type InterruptIndex = u32;

/// Configuration of a legacy, line based interrupt source.
#[derive(Copy, Clone, Debug)]
pub struct LegacyIrqSourceConfig {
    pub irqchip: u32,
    pub pin: u32,
}

/// Configuration of an interrupt source.
#[derive(Copy, Clone, Debug)]
pub enum InterruptSourceConfig {
    LegacyIrq(LegacyIrqSourceConfig),
}

/// A group of interrupt sources sharing one routing decision.
///
/// Legacy devices own a single-entry group and address it with index 0.
pub trait InterruptSourceGroup: Send + Sync {
    /// Assert the interrupt source.
    fn trigger(&self, index: InterruptIndex) -> io::Result<()>;

    /// Deassert the interrupt source. Only meaningful for level-triggered
    /// lines; edge-triggered implementations may ignore it.
    fn untrigger(&self, _index: InterruptIndex) -> io::Result<()> {
        Ok(())
    }

    /// Update the configuration of the interrupt source.
    fn update(&self, index: InterruptIndex, config: InterruptSourceConfig) -> io::Result<()>;

    /// Event notifier behind the interrupt source, if any.
    fn notifier(&self, _index: InterruptIndex) -> Option<EventFd> {
        None
    }
}
