//! Collaborator traits: the boundary between this crate and a host kernel.
//!
//! The dispatcher never touches hardware directly. It calls out through
//! these traits for the three things a kernel must supply: performing an
//! actual context switch, allocating a thread's stack, and masking
//! interrupts. A host kernel implements all three; tests use the defaults
//! below plus a recording mock.

use alloc::boxed::Box;

use crate::thread::ThreadId;

/// Performs the low-level register/stack switch between two threads.
///
/// This crate never emits architecture-specific assembly; it calls
/// `switch` and trusts the host kernel to have "become" `next` by the time
/// control returns to the dispatcher (on real hardware, control does not
/// return to this call site in the outgoing thread at all).
pub trait ContextSwitch: Send {
    /// `next` is `None` when the dispatcher has nothing ready and is
    /// switching to the idle path.
    fn switch(&mut self, prev: Option<ThreadId>, next: Option<ThreadId>);
}

/// Allocates the backing memory for a new thread's stack.
pub trait StackAllocator: Send {
    fn alloc_stack(&mut self, size: usize) -> Option<Box<[u8]>>;
}

/// Opaque token representing the interrupt level in effect before a
/// `disable()` call. Passing it to `set_level` restores exactly that
/// level, never unconditionally re-enabling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptLevel(bool);

impl InterruptLevel {
    pub const ENABLED: InterruptLevel = InterruptLevel(true);
    pub const DISABLED: InterruptLevel = InterruptLevel(false);

    pub fn is_enabled(self) -> bool {
        self.0
    }
}

/// Models `intr_disable`/`intr_enable`/`intr_set_level`/`intr_get_level`/
/// `intr_context`. Nested disable/enable pairs must save and restore the
/// previous level rather than unconditionally enabling, which is why
/// `disable` returns a token instead of `()`.
pub trait InterruptControl: Send {
    fn disable(&self) -> InterruptLevel;
    fn enable(&self) -> InterruptLevel;
    fn set_level(&self, level: InterruptLevel) -> InterruptLevel;
    fn get_level(&self) -> InterruptLevel;
    fn is_context(&self) -> bool;
}

/// Default [`StackAllocator`] backed by the ordinary Rust allocator.
/// Good enough for tests and for a host kernel that has already mapped
/// a heap; a real page-backed kernel substitutes its own allocator that
/// can fail gracefully under memory pressure.
pub struct GlobalStackAllocator;

impl StackAllocator for GlobalStackAllocator {
    fn alloc_stack(&mut self, size: usize) -> Option<Box<[u8]>> {
        Some(alloc::vec![0u8; size].into_boxed_slice())
    }
}

/// Default [`InterruptControl`] for a single-CPU, non-SMP build: a nesting
/// counter guarded by its own lock. A real kernel substitutes one that
/// masks actual hardware interrupts via `cli`/`sti`.
pub struct SingleCpuInterruptControl {
    enabled: spin::Mutex<bool>,
}

impl SingleCpuInterruptControl {
    pub const fn new() -> Self {
        SingleCpuInterruptControl {
            enabled: spin::Mutex::new(true),
        }
    }
}

impl Default for SingleCpuInterruptControl {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptControl for SingleCpuInterruptControl {
    fn disable(&self) -> InterruptLevel {
        let mut guard = self.enabled.lock();
        let prev = InterruptLevel(*guard);
        *guard = false;
        prev
    }

    fn enable(&self) -> InterruptLevel {
        let mut guard = self.enabled.lock();
        let prev = InterruptLevel(*guard);
        *guard = true;
        prev
    }

    fn set_level(&self, level: InterruptLevel) -> InterruptLevel {
        let mut guard = self.enabled.lock();
        let prev = InterruptLevel(*guard);
        *guard = level.0;
        prev
    }

    fn get_level(&self) -> InterruptLevel {
        InterruptLevel(*self.enabled.lock())
    }

    fn is_context(&self) -> bool {
        false
    }
}

/// Test/host-agnostic [`ContextSwitch`] that just records the sequence of
/// threads it was asked to switch to, without performing any real switch.
/// Used by dispatcher tests to assert on scheduling order without needing
/// a real kernel underneath.
#[cfg(any(test, feature = "test-support"))]
pub struct RecordingContextSwitch {
    pub history: alloc::vec::Vec<(Option<ThreadId>, Option<ThreadId>)>,
}

#[cfg(any(test, feature = "test-support"))]
impl RecordingContextSwitch {
    pub fn new() -> Self {
        RecordingContextSwitch {
            history: alloc::vec::Vec::new(),
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Default for RecordingContextSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-support"))]
impl ContextSwitch for RecordingContextSwitch {
    fn switch(&mut self, prev: Option<ThreadId>, next: Option<ThreadId>) {
        self.history.push((prev, next));
    }
}
