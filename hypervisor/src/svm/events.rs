use crate::svm::data::vcpu_data::VcpuData;
use bitfield::bitfield;

bitfield! {
    /// See `15.20 Event Injection`.
    ///
    /// Setting this field in the VMCB makes the next `vmrun` deliver the
    /// described exception or interrupt to the guest before it executes its
    /// first instruction.
    ///
    /// ## Fields
    ///
    /// - `Vector`: The 8-bit IDT vector of the interrupt or exception.
    /// - `Type`: 0 = INTR, 2 = NMI, 3 = exception, 4 = software interrupt.
    /// - `Error Code Valid` (`EV`): Set if an error code is pushed.
    /// - `Valid`: Set if an event is to be injected.
    /// - `Error Code`: The error code to push, if `EV` is set.
    pub struct EventInjection(u64);
    impl Debug;
    pub get_vector, set_vector: 7, 0;                       // [0-7]
    pub get_type, set_type: 10, 8;                          // [8-10]
    pub get_error_code_valid, set_error_code_valid: 11, 11; // [11]
    // Reserved                                             // [12-30]
    pub get_valid, set_valid: 31, 31;                       // [31]
    pub get_error_code, set_error_code: 63, 32;             // [32-63]
}

const EVENT_TYPE_EXCEPTION: u64 = 3;

impl EventInjection {
    /// See `8.2.14 #GP - General-Protection Exception`.
    pub fn gp() -> Self {
        let mut event = EventInjection(0);
        event.set_vector(13);
        event.set_type(EVENT_TYPE_EXCEPTION);
        event.set_error_code_valid(1);
        event.set_valid(1);

        event
    }

    /// See `8.2.7 #UD - Invalid-Opcode Exception`.
    pub fn ud() -> Self {
        let mut event = EventInjection(0);
        event.set_vector(6);
        event.set_type(EVENT_TYPE_EXCEPTION);
        event.set_valid(1);

        event
    }

    /// See `8.2.15 #PF - Page-Fault Exception`. The caller also has to load
    /// the faulting address into the guest CR2.
    pub fn pf(error_code: u32) -> Self {
        let mut event = EventInjection(0);
        event.set_vector(14);
        event.set_type(EVENT_TYPE_EXCEPTION);
        event.set_error_code_valid(1);
        event.set_error_code(error_code as u64);
        event.set_valid(1);

        event
    }

    /// Injects the event into the guest vmcb.
    pub fn inject(&self, data: &mut VcpuData) {
        data.guest_vmcb.control_area.event_inj = self.0;
    }

    /// Raw value of the field, as written into the vmcb.
    pub fn bits(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ud_encoding() {
        assert_eq!(EventInjection::ud().0, (1 << 31) | (3 << 8) | 6);
    }

    #[test]
    fn pf_carries_the_error_code() {
        let event = EventInjection::pf(0x11);
        assert_eq!(event.get_vector(), 14);
        assert_eq!(event.get_error_code_valid(), 1);
        assert_eq!(event.get_error_code(), 0x11);
        assert_eq!(event.get_valid(), 1);
    }
}
