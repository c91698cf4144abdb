//! Type-2 AMD SVM hypervisor that virtualizes the running host in place.
//!
//! Each logical processor is put under an infinite `vmrun` loop that executes
//! the host itself as the guest. The guest keeps running unmodified; the
//! hypervisor only surfaces for the intercepts configured in the VMCB and for
//! the VMMCALL interface used by the trusted userland client.
//!
//! The host driver is responsible for the pieces this crate treats as
//! external: the entry/unload glue, a log sink, the per-CPU broadcast that
//! invokes [`Hypervisor::virtualize_current_processor`] on every core, and the
//! `launch_vm` assembly trampoline (see [`svm::vmlaunch`]).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate static_assertions;

pub mod error;
pub mod guest_mem;
pub mod hooks;
pub mod hypercall;
pub mod npt;
pub mod platform;
pub mod process;
pub mod stealth;
pub mod svm;
pub mod telemetry;
pub mod utils;

use crate::error::{HvError, Result};
use crate::svm::{support, vcpu::Vcpu};
use alloc::vec::Vec;

pub struct Hypervisor {
    vcpus: Vec<Vcpu>,
}

impl Hypervisor {
    /// Creates a vcpu for every processor on the system.
    ///
    /// Nothing is virtualized yet; the caller has to invoke
    /// [`Self::virtualize_current_processor`] on each core afterwards.
    pub fn new() -> Result<Self> {
        support::check_svm_support()?;

        let mut vcpus = Vec::new();
        for index in 0..platform::processor_count() {
            vcpus.push(Vcpu::new(index)?);
        }
        log::info!("Found {} processors", vcpus.len());

        Ok(Self { vcpus })
    }

    /// Virtualizes the processor this code is currently running on.
    pub fn virtualize_current_processor(&mut self) -> Result<()> {
        let index = platform::current_processor_index();

        let Some(vcpu) = self.vcpus.get_mut(index as usize) else {
            log::error!("No vcpu for processor {}", index);
            return Err(HvError::UnknownProcessor { index });
        };

        vcpu.virtualize()
    }

    pub fn vcpus(&self) -> &[Vcpu] {
        &self.vcpus
    }
}
