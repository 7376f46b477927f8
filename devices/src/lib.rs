// Copyright © 2022, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Emulated platform devices.

#[macro_use]
extern crate log;

pub mod tpm_tis;
