//! Fiber attributes

use std::sync::Arc;

use crate::fls::KeyTablePool;

/// Which stack a fiber executes on.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum StackClass {
    /// No allocated stack: the body runs directly on the worker thread's
    /// own stack. Such a fiber cannot suspend cooperatively; blocking
    /// operations park the OS thread instead.
    Inline,
    Small,
    #[default]
    Normal,
    Large,
}

/// Attribute flag bits.
pub mod flags {
    /// Log fiber start and finish through the kprint macros.
    pub const LOG_START_AND_FINISH: u32 = 0x1;
    /// Log every context switch into/out of this fiber.
    pub const LOG_CONTEXT_SWITCH: u32 = 0x2;
    /// Creation does not wake idle workers; the creator flushes later.
    pub const NO_SIGNAL: u32 = 0x4;
    /// Reserved for long-running service fibers excluded from drain logic.
    pub const NEVER_QUIT: u32 = 0x8;
}

/// Creation attributes for a fiber.
#[derive(Clone, Default)]
pub struct FiberAttr {
    pub stack_class: StackClass,
    pub flags: u32,
    /// Pre-built local-storage tables shared by fibers of this attribute.
    pub keytable_pool: Option<Arc<KeyTablePool>>,
}

impl FiberAttr {
    pub fn new(stack_class: StackClass) -> Self {
        FiberAttr {
            stack_class,
            flags: 0,
            keytable_pool: None,
        }
    }

    pub fn small() -> Self {
        Self::new(StackClass::Small)
    }

    pub fn normal() -> Self {
        Self::new(StackClass::Normal)
    }

    pub fn large() -> Self {
        Self::new(StackClass::Large)
    }

    pub fn inline_stack() -> Self {
        Self::new(StackClass::Inline)
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_keytable_pool(mut self, pool: Arc<KeyTablePool>) -> Self {
        self.keytable_pool = Some(pool);
        self
    }

    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

impl std::fmt::Debug for FiberAttr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberAttr")
            .field("stack_class", &self.stack_class)
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("keytable_pool", &self.keytable_pool.is_some())
            .finish()
    }
}
