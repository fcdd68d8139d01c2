//! OS adapters and syscall callbacks.

use std::{any::Any, rc::Rc};

use crate::{Driver, Error, Pa, ProcessId, Registers, Va};

/// Register state handed to a call callback.
#[derive(Debug, Clone, Copy)]
pub struct CallEvent {
    /// The process the call was issued from.
    pub pid: ProcessId,

    /// The in-flight key: the guest stack pointer at the call site.
    pub thread_id: Va,

    /// The register image at the call site.
    pub registers: Registers,
}

/// Register state handed to a return callback.
#[derive(Debug, Clone, Copy)]
pub struct ReturnEvent {
    /// The process the call returns to.
    pub pid: ProcessId,

    /// The in-flight key of the matching call.
    pub thread_id: Va,

    /// The register image at the return site. `rax` holds the call's result.
    pub registers: Registers,
}

/// Callbacks attached to one traced kernel function.
///
/// The handler owns whatever configuration it needs; the engine never
/// interprets it. State returned by [`on_call`] is carried across the
/// call and handed to [`on_return`] exactly once, which owns it from then on.
///
/// Handlers run synchronously on the event loop and must not block.
///
/// [`on_call`]: SyscallHandler::on_call
/// [`on_return`]: SyscallHandler::on_return
pub trait SyscallHandler {
    /// Invoked when the guest enters the traced function.
    fn on_call(&self, event: &CallEvent) -> Option<Box<dyn Any>>;

    /// Invoked when the traced function returns.
    fn on_return(&self, event: &ReturnEvent, state: Option<Box<dyn Any>>);
}

/// A named callback registration.
pub struct CallbackEntry {
    /// Kernel symbol of the traced function.
    pub symbol: String,

    /// Callbacks to attach to it.
    pub handler: Rc<dyn SyscallHandler>,
}

impl CallbackEntry {
    /// Creates a new entry.
    pub fn new(symbol: impl Into<String>, handler: Rc<dyn SyscallHandler>) -> Self {
        Self {
            symbol: symbol.into(),
            handler,
        }
    }
}

/// Guest-OS specific knowledge the engine depends on.
///
/// The engine itself is OS-agnostic; everything that requires understanding
/// the guest kernel's layout (symbols, the syscall dispatch shape, process
/// bookkeeping) comes through this trait.
pub trait OsAdapter<D>
where
    D: Driver,
{
    /// Resolves a kernel symbol to its virtual address.
    fn symbol_va(&self, symbol: &str) -> Option<Va>;

    /// Locates the instruction immediately following the dispatch call in
    /// the syscall entry handler at `lstar`. Resolved exactly once.
    fn return_point(&self, driver: &D, lstar: Va) -> Result<Va, Error>;

    /// Maps a page-table root to the owning process identifier.
    fn process_id(&self, driver: &D, root: Pa) -> Result<ProcessId, Error>;

    /// The adapter's default set of traced functions.
    fn callback_table(&self) -> Vec<CallbackEntry>;
}
