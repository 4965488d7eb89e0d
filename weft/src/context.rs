//! # Stackful Context Switch
//!
//! The lowest layer of the runtime: saving one execution context and
//! resuming another on the same OS thread. A [`Context`] is nothing but a
//! saved stack pointer; the callee-saved registers live in a fixed-layout
//! frame on the context's own stack, so [`switch`] is a handful of
//! instructions with no heap traffic.
//!
//! ## First-switch convention
//!
//! [`make_context`] builds a frame whose saved return address points at a
//! per-architecture shim. The first switch into the context "returns" into
//! the shim, which moves the carried argument into the ABI argument
//! register and calls the entry function. Entry functions never return;
//! they must switch away for good (the ULT layer does this when an entry
//! closure finishes).
//!
//! Only callee-saved state is kept, including the callee-saved FP
//! registers on aarch64 and riscv64 (on x86_64 SysV the vector registers
//! are caller-saved and need no slot).

use crate::error::{Error, Result};

/// Entry signature for a fresh context. The pointer is the opaque argument
/// given to [`make_context`].
pub(crate) type RawEntry = extern "C" fn(*mut u8) -> !;

/// A suspended execution context: the stack pointer left behind by
/// [`switch`]. Everything else is in the switch frame it points at.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct Context {
    sp: *mut u8,
}

impl Context {
    pub(crate) const fn null() -> Self {
        Context {
            sp: std::ptr::null_mut(),
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Switch frame: r15, r14, r13, r12, rbx, rbp, return address.
        const FRAME_WORDS: usize = 7;
        const ENTRY_SLOT: usize = 2; // r13
        const ARG_SLOT: usize = 3; // r12
        const RET_SLOT: usize = 6;

        /// Save the caller's callee-saved registers on its stack, record the
        /// stack pointer in `from`, load the stack pointer from `to`, restore
        /// its registers and return into it.
        ///
        /// # Safety
        ///
        /// `from` and `to` must point at live [`Context`]s whose stacks stay
        /// allocated for as long as either side can resume, and both contexts
        /// must belong to the calling OS thread.
        #[unsafe(naked)]
        pub(crate) unsafe extern "C" fn switch(_from: *mut Context, _to: *const Context) {
            core::arch::naked_asm!(
                "push rbp",
                "push rbx",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "mov [rdi], rsp",
                "mov rsp, [rsi]",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop rbx",
                "pop rbp",
                "ret",
            )
        }

        /// First-switch target: the argument was parked in r12 and the entry
        /// function in r13 by [`make_context`]. `call` keeps the stack at the
        /// alignment an extern "C" function expects.
        #[unsafe(naked)]
        unsafe extern "C" fn start_shim() {
            core::arch::naked_asm!(
                "mov rdi, r12",
                "call r13",
                "ud2",
            )
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// Switch frame: x19..x28, x29, x30, d8..d15.
        const FRAME_WORDS: usize = 20;
        const ENTRY_SLOT: usize = 1; // x20
        const ARG_SLOT: usize = 0; // x19
        const RET_SLOT: usize = 11; // x30

        /// See the x86_64 variant for the contract.
        ///
        /// # Safety
        ///
        /// Same as the x86_64 variant.
        #[unsafe(naked)]
        pub(crate) unsafe extern "C" fn switch(_from: *mut Context, _to: *const Context) {
            core::arch::naked_asm!(
                "sub sp, sp, #160",
                "stp x19, x20, [sp, #0]",
                "stp x21, x22, [sp, #16]",
                "stp x23, x24, [sp, #32]",
                "stp x25, x26, [sp, #48]",
                "stp x27, x28, [sp, #64]",
                "stp x29, x30, [sp, #80]",
                "stp d8, d9, [sp, #96]",
                "stp d10, d11, [sp, #112]",
                "stp d12, d13, [sp, #128]",
                "stp d14, d15, [sp, #144]",
                "mov x9, sp",
                "str x9, [x0]",
                "ldr x9, [x1]",
                "mov sp, x9",
                "ldp x19, x20, [sp, #0]",
                "ldp x21, x22, [sp, #16]",
                "ldp x23, x24, [sp, #32]",
                "ldp x25, x26, [sp, #48]",
                "ldp x27, x28, [sp, #64]",
                "ldp x29, x30, [sp, #80]",
                "ldp d8, d9, [sp, #96]",
                "ldp d10, d11, [sp, #112]",
                "ldp d12, d13, [sp, #128]",
                "ldp d14, d15, [sp, #144]",
                "add sp, sp, #160",
                "ret",
            )
        }

        /// First-switch target: argument in x19, entry in x20.
        #[unsafe(naked)]
        unsafe extern "C" fn start_shim() {
            core::arch::naked_asm!(
                "mov x0, x19",
                "blr x20",
                "brk #0x1",
            )
        }
    } else if #[cfg(target_arch = "riscv64")] {
        /// Switch frame: ra, s0..s11, fs0..fs11 (25 slots, padded to 16 bytes).
        const FRAME_WORDS: usize = 26;
        const ENTRY_SLOT: usize = 3; // s2
        const ARG_SLOT: usize = 2; // s1
        const RET_SLOT: usize = 0; // ra

        /// See the x86_64 variant for the contract.
        ///
        /// # Safety
        ///
        /// Same as the x86_64 variant.
        #[unsafe(naked)]
        pub(crate) unsafe extern "C" fn switch(_from: *mut Context, _to: *const Context) {
            core::arch::naked_asm!(
                "addi sp, sp, -208",
                "sd ra, 0(sp)",
                "sd s0, 8(sp)",
                "sd s1, 16(sp)",
                "sd s2, 24(sp)",
                "sd s3, 32(sp)",
                "sd s4, 40(sp)",
                "sd s5, 48(sp)",
                "sd s6, 56(sp)",
                "sd s7, 64(sp)",
                "sd s8, 72(sp)",
                "sd s9, 80(sp)",
                "sd s10, 88(sp)",
                "sd s11, 96(sp)",
                "fsd fs0, 104(sp)",
                "fsd fs1, 112(sp)",
                "fsd fs2, 120(sp)",
                "fsd fs3, 128(sp)",
                "fsd fs4, 136(sp)",
                "fsd fs5, 144(sp)",
                "fsd fs6, 152(sp)",
                "fsd fs7, 160(sp)",
                "fsd fs8, 168(sp)",
                "fsd fs9, 176(sp)",
                "fsd fs10, 184(sp)",
                "fsd fs11, 192(sp)",
                "sd sp, 0(a0)",
                "ld sp, 0(a1)",
                "ld ra, 0(sp)",
                "ld s0, 8(sp)",
                "ld s1, 16(sp)",
                "ld s2, 24(sp)",
                "ld s3, 32(sp)",
                "ld s4, 40(sp)",
                "ld s5, 48(sp)",
                "ld s6, 56(sp)",
                "ld s7, 64(sp)",
                "ld s8, 72(sp)",
                "ld s9, 80(sp)",
                "ld s10, 88(sp)",
                "ld s11, 96(sp)",
                "fld fs0, 104(sp)",
                "fld fs1, 112(sp)",
                "fld fs2, 120(sp)",
                "fld fs3, 128(sp)",
                "fld fs4, 136(sp)",
                "fld fs5, 144(sp)",
                "fld fs6, 152(sp)",
                "fld fs7, 160(sp)",
                "fld fs8, 168(sp)",
                "fld fs9, 176(sp)",
                "fld fs10, 184(sp)",
                "fld fs11, 192(sp)",
                "addi sp, sp, 208",
                "ret",
            )
        }

        /// First-switch target: argument in s1, entry in s2.
        #[unsafe(naked)]
        unsafe extern "C" fn start_shim() {
            core::arch::naked_asm!(
                "mv a0, s1",
                "jalr s2",
                "unimp",
            )
        }
    } else {
        compile_error!("unsupported architecture: the context switch needs x86_64, aarch64 or riscv64");
    }
}

/// Build a context that, on first switch, runs `entry(arg)` on `stack_top`.
///
/// `stack_top` is the high end of the stack (16-byte aligned; stacks grow
/// down). The frame is written into the stack memory itself.
///
/// # Safety
///
/// `stack_top` must point at the top of a writable region with room for the
/// switch frame, and the region must outlive the returned context.
pub(crate) unsafe fn make_context(stack_top: *mut u8, entry: RawEntry, arg: *mut u8) -> Context {
    // Frame sizes are chosen per architecture so that the stack pointer at
    // entry satisfies the ABI alignment after the shim's call.
    let sp = stack_top.sub(FRAME_WORDS * 8);
    let words = sp.cast::<u64>();
    for i in 0..FRAME_WORDS {
        words.add(i).write(0);
    }
    words.add(ENTRY_SLOT).write(entry as usize as u64);
    words.add(ARG_SLOT).write(arg as u64);
    words.add(RET_SLOT).write(start_shim as usize as u64);
    Context { sp }
}

/// Default ULT stack size; override globally with `WEFT_STACK_SIZE` or per
/// ULT through the creation attributes.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest stack the runtime will hand out; anything less cannot even hold
/// the switch frame plus a useful call chain.
pub const MIN_STACK_SIZE: usize = 4 * 1024;

/// Heap-allocated ULT stack. Kept alive for as long as any context refers
/// to it; reused verbatim when a terminated ULT is revived.
pub(crate) struct UltStack {
    buf: Vec<u8>,
}

impl UltStack {
    pub(crate) fn new(size: usize) -> Result<Self> {
        let size = size.max(MIN_STACK_SIZE);
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).map_err(|_| Error::Resource)?;
        buf.resize(size, 0);
        Ok(UltStack { buf })
    }

    /// High end of the stack, aligned down to 16 bytes.
    pub(crate) fn top(&self) -> *mut u8 {
        let end = self.buf.as_ptr() as usize + self.buf.len();
        (end & !15) as *mut u8
    }

    pub(crate) fn base(&self) -> *const u8 {
        self.buf.as_ptr()
    }

    pub(crate) fn size(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn stack_top_is_aligned() {
        let stack = UltStack::new(DEFAULT_STACK_SIZE).unwrap();
        assert_eq!(stack.top() as usize % 16, 0);
        assert!(stack.top() as usize > stack.base() as usize);
    }

    #[test]
    fn stack_size_has_a_floor() {
        let stack = UltStack::new(1).unwrap();
        assert!(stack.size() >= MIN_STACK_SIZE);
    }

    #[test]
    fn first_switch_runs_entry_with_arg() {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        static mut MAIN_CTX: Context = Context::null();
        static mut TASK_CTX: Context = Context::null();

        extern "C" fn visit_once(arg: *mut u8) -> ! {
            COUNTER.store(arg as u32, Ordering::SeqCst);
            unsafe {
                switch(&raw mut TASK_CTX, &raw const MAIN_CTX);
            }
            unreachable!()
        }

        let stack = UltStack::new(DEFAULT_STACK_SIZE).unwrap();
        unsafe {
            TASK_CTX = make_context(stack.top(), visit_once, 42usize as *mut u8);
            switch(&raw mut MAIN_CTX, &raw const TASK_CTX);
        }
        assert_eq!(COUNTER.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn switch_round_trip_resumes_where_it_left() {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        static mut MAIN_CTX: Context = Context::null();
        static mut TASK_CTX: Context = Context::null();

        extern "C" fn visit_twice(_arg: *mut u8) -> ! {
            COUNTER.fetch_add(1, Ordering::SeqCst);
            unsafe {
                switch(&raw mut TASK_CTX, &raw const MAIN_CTX);
            }
            COUNTER.fetch_add(10, Ordering::SeqCst);
            unsafe {
                switch(&raw mut TASK_CTX, &raw const MAIN_CTX);
            }
            unreachable!()
        }

        let stack = UltStack::new(DEFAULT_STACK_SIZE).unwrap();
        unsafe {
            TASK_CTX = make_context(stack.top(), visit_twice, std::ptr::null_mut());
            switch(&raw mut MAIN_CTX, &raw const TASK_CTX);
            assert_eq!(COUNTER.load(Ordering::SeqCst), 1);
            switch(&raw mut MAIN_CTX, &raw const TASK_CTX);
        }
        assert_eq!(COUNTER.load(Ordering::SeqCst), 11);
    }
}
