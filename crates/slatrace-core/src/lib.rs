//! Stealthy guest syscall tracing over alternate SLAT views.
//!
//! The engine maintains two guest physical mappings: the default view maps
//! the kernel unmodified, while a shadow view substitutes copies of
//! individual kernel-code frames with one-byte breakpoints emplaced at
//! traced function entries. The engine flips a VCPU between the views for
//! exactly one instruction whenever it trips a breakpoint or the guest
//! inspects an instrumented page, so the guest only ever observes its
//! original bytes.
//!
//! Return paths are traced without disassembling every call site: the
//! engine overwrites the return slot on the guest stack so the function
//! "returns" onto a breakpoint byte that already exists in the kernel's
//! syscall entry page, then redirects the VCPU to the real post-dispatch
//! instruction.

#![warn(missing_docs)]

mod addr;
mod driver;
mod error;
mod event;
mod os;
mod regs;
mod tracer;

pub use self::{
    addr::{
        DomainInfo, Gfn, MemoryAccess, Pa, ProcessId, Va, VcpuId, View, BREAKPOINT, PAGE_MASK,
        PAGE_SHIFT, PAGE_SIZE,
    },
    driver::{Driver, EventMonitor},
    error::Error,
    event::{
        EventInterrupt, EventMemoryAccess, EventReason, EventResponse, EventSinglestep,
        ResponseFlags, TraceEvent,
    },
    os::{CallEvent, CallbackEntry, OsAdapter, ReturnEvent, SyscallHandler},
    regs::{GpRegisters, Registers},
    tracer::{PauseGuard, Tracer, MAX_VCPUS},
};
