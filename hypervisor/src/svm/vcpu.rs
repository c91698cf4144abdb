use crate::error::{HvError, Result};
use crate::platform::{self, Context};
use crate::svm::data::vcpu_data::VcpuData;
use crate::svm::support;
use crate::svm::vmlaunch::{launch_vm, LAUNCH_SENTINEL};
use crate::utils::memory::AllocatedMemory;

pub struct Vcpu {
    /// The index of the processor.
    index: u32,

    data: AllocatedMemory<VcpuData>,
}

impl Vcpu {
    /// Allocates everything the processor needs. The VMCB is built later, at
    /// launch time, from the captured context.
    pub fn new(index: u32) -> Result<Self> {
        log::trace!("Creating vcpu for processor {}", index);

        Ok(Self {
            index,
            data: VcpuData::new(index)?,
        })
    }

    /// Puts the current processor under the vmrun loop.
    ///
    /// The context captured here is the point the guest resumes at: the first
    /// `vmrun` re-executes the capture with the sentinel in RAX, which is the
    /// branch below that reports success. Everything between the capture and
    /// `launch_vm` only runs on the initial pass.
    pub fn virtualize(&mut self) -> Result<()> {
        log::info!("Virtualizing processor {}", self.index);

        support::enable_svm();

        let mut context = Context::zeroed();
        platform::capture_context(&mut context);

        // Did we just come back as the guest?
        //
        if context.rax == LAUNCH_SENTINEL {
            log::info!("Processor {} is now virtualized", self.index);
            self.data.active = true;
            return Ok(());
        }

        log::info!("Preparing vmcb for processor {}", self.index);
        self.data.prepare_for_virtualization(&mut context);

        log::info!("Launching vm on processor {}", self.index);
        let host_rsp = &mut self.data.host_stack_layout.guest_vmcb_pa as *mut u64;
        unsafe { launch_vm(host_rsp) };

        // The trampoline never returns; reaching this point means vmrun
        // refused the control block.
        log::error!("launch_vm returned on processor {}", self.index);
        Err(HvError::LaunchFailed)
    }

    pub fn is_active(&self) -> bool {
        self.data.active
    }

    pub fn id(&self) -> u32 {
        self.index
    }
}
