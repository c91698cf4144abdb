use bitfield::bitfield;

bitfield! {
    /// A code or data descriptor in the GDT. See `4.8.1 Code-Segment
    /// Descriptors` and `4.8.2 Data-Segment Descriptors`.
    pub struct SegmentDescriptor(u64);
    pub get_limit_low, _: 15, 0;
    pub get_base_low, _: 31, 16;
    pub get_base_middle, _: 39, 32;
    pub get_type, _: 43, 40;
    pub get_system, _: 44, 44;
    pub get_dpl, _: 46, 45;
    pub get_present, _: 47, 47;
    pub get_limit_high, _: 51, 48;
    pub get_avl, _: 52, 52;
    pub get_long_mode, _: 53, 53;
    pub get_default_bit, _: 54, 54;
    pub get_granularity, _: 55, 55;
    pub get_base_high, _: 63, 56;
}

bitfield! {
    /// The 16-bit attribute format the VMCB state-save area expects, a packed
    /// version of the descriptor access rights.
    pub struct SegmentAttribute(u16);
    pub get_type, set_type: 3, 0;
    pub get_system, set_system: 4, 4;
    pub get_dpl, set_dpl: 6, 5;
    pub get_present, set_present: 7, 7;
    pub get_avl, set_avl: 8, 8;
    pub get_long_mode, set_long_mode: 9, 9;
    pub get_default_bit, set_default_bit: 10, 10;
    pub get_granularity, set_granularity: 11, 11;
}
