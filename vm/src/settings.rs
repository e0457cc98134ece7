use sci_bytecode::FormatOptions;

/// What to do when a temp or parameter is read before it was written and no
/// workaround covers the read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UninitializedReadPolicy {
    /// Substitute `0` and log a warning.
    #[default]
    Lenient,
    /// Stop with an error.
    Strict,
}

/// Global variable mirrored into a property of a named object on every
/// non-null write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorSwap {
    pub global: u16,
    pub object_name: String,
    pub selector: String,
}

impl Default for ActorSwap {
    fn default() -> Self {
        Self {
            global: 0,
            object_name: "stopGroop".into(),
            selector: "client".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VmSettings {
    /// Data stack size in slots.
    pub stack_size: usize,
    pub max_exec_frames: usize,
    /// Limit on runs nested through kernel calls.
    pub max_run_depth: usize,
    /// Kernel calls between garbage collector invocations.
    pub gc_interval: u32,
    pub uninit_policy: UninitializedReadPolicy,
    /// Key into workaround tables.
    pub game_id: String,
    /// Global holding the current room number.
    pub room_global: u16,
    pub actor_swap: Option<ActorSwap>,
    /// Mask the low bit of send selectors.
    pub legacy_selector_lsb: bool,
    /// `callk` ignores a pending `&rest`.
    pub legacy_kernel_rest: bool,
    /// `mod` keeps the sign of the dividend instead of returning a
    /// non-negative result.
    pub truncating_modulo: bool,
    /// Integers up to this value compare below any pointer.
    pub pointer_compare_limit: u16,
    pub wide_call_operands: bool,
    pub offset_lofs: bool,
}

impl VmSettings {
    pub fn format_options(&self) -> FormatOptions {
        FormatOptions {
            offset_lofs: self.offset_lofs,
            wide_call_operands: self.wide_call_operands,
            ..FormatOptions::default()
        }
    }
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            stack_size: 0x1000,
            max_exec_frames: 1024,
            max_run_depth: 64,
            gc_interval: 50,
            uninit_policy: UninitializedReadPolicy::Lenient,
            game_id: String::new(),
            room_global: 11,
            actor_swap: Some(ActorSwap::default()),
            legacy_selector_lsb: false,
            legacy_kernel_rest: false,
            truncating_modulo: false,
            pointer_compare_limit: 0,
            wide_call_operands: false,
            offset_lofs: false,
        }
    }
}
