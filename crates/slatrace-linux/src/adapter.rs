//! The Linux OS adapter.

use std::{any::Any, rc::Rc};

use capstone::prelude::*;
use slatrace_core::{
    CallEvent, CallbackEntry, Driver, Error, OsAdapter, Pa, ProcessId, ReturnEvent, SyscallHandler,
    Va, PAGE_MASK, PAGE_SIZE,
};

use crate::{LinuxOffsets, SymbolTable};

/// Traced by default: a syscall surface wide enough to sketch process,
/// file and network activity without drowning the log.
const TRACED_SYSCALLS: &[&str] = &[
    "read",
    "write",
    "open",
    "openat",
    "close",
    "mmap",
    "munmap",
    "ioctl",
    "clone",
    "execve",
    "exit_group",
    "kill",
    "connect",
    "accept4",
    "sendto",
    "recvfrom",
    "unlinkat",
    "chdir",
];

/// Upper bound on the task-list walk, in case the list is corrupt or the
/// offsets profile is wrong.
const MAX_TASKS: usize = 65_536;

/// Adapter for Linux guests.
///
/// Symbol knowledge comes from the kernel's System.map; process
/// bookkeeping needs a [`LinuxOffsets`] profile on top. Without one, calls
/// are still traced but attributed to process 0.
pub struct LinuxOs {
    symbols: SymbolTable,
    offsets: Option<LinuxOffsets>,
}

impl LinuxOs {
    /// Creates an adapter from a parsed symbol table.
    pub fn new(symbols: SymbolTable) -> Self {
        Self {
            symbols,
            offsets: None,
        }
    }

    /// Adds a structure-layout profile, enabling PID resolution.
    pub fn with_offsets(self, offsets: LinuxOffsets) -> Self {
        Self {
            offsets: Some(offsets),
            ..self
        }
    }

    /// The default set of traced syscalls, with logging handlers, filtered
    /// down to the symbols this kernel actually exports.
    pub fn default_callbacks(&self) -> Vec<CallbackEntry> {
        TRACED_SYSCALLS
            .iter()
            .filter_map(|name| {
                // SYSCALL_DEFINE wrappers on modern kernels, plain
                // sys_ symbols on older ones.
                let candidates = [format!("__x64_sys_{name}"), format!("sys_{name}")];
                let symbol = candidates
                    .into_iter()
                    .find(|symbol| self.symbols.get(symbol).is_some())?;

                let handler: Rc<dyn SyscallHandler> = Rc::new(LogHandler { name });
                Some(CallbackEntry::new(symbol, handler))
            })
            .collect()
    }
}

impl<D> OsAdapter<D> for LinuxOs
where
    D: Driver,
{
    fn symbol_va(&self, symbol: &str) -> Option<Va> {
        self.symbols.get(symbol)
    }

    fn return_point(&self, driver: &D, lstar: Va) -> Result<Va, Error> {
        let pa = driver.translate_kernel(lstar)?;

        let mut code = [0u8; PAGE_SIZE as usize];
        driver.read(pa, &mut code)?;

        find_post_dispatch(&code, lstar)
    }

    fn process_id(&self, driver: &D, root: Pa) -> Result<ProcessId, Error> {
        let offsets = match &self.offsets {
            Some(offsets) => offsets,
            None => return Ok(ProcessId(0)),
        };

        let init_task = self
            .symbols
            .get("init_task")
            .ok_or_else(|| Error::Symbol("init_task".into()))?;

        let mut task = init_task;

        for _ in 0..MAX_TASKS {
            // Kernel threads borrow whatever mm was active; only tasks
            // with their own mm can be matched against the root.
            let mm = read_kernel_u64(driver, task + offsets.task_struct_mm)?;
            if mm != 0 {
                let pgd = read_kernel_u64(driver, Va(mm) + offsets.mm_struct_pgd)?;
                let pgd_pa = driver.translate_kernel(Va(pgd))?;

                if pgd_pa.0 & PAGE_MASK == root.0 & PAGE_MASK {
                    let pid = read_kernel_u32(driver, task + offsets.task_struct_pid)?;
                    return Ok(ProcessId(pid as i32));
                }
            }

            let next = read_kernel_u64(driver, task + offsets.task_struct_tasks)?;
            task = Va(next) - offsets.task_struct_tasks;

            if task == init_task {
                // The root belongs to no user task: kernel context.
                return Ok(ProcessId(0));
            }
        }

        tracing::warn!(%root, "task list walk did not terminate");
        Ok(ProcessId(0))
    }

    fn callback_table(&self) -> Vec<CallbackEntry> {
        self.default_callbacks()
    }
}

/// Disassembles the syscall entry handler and returns the address of the
/// instruction following the first near call, i.e. the point execution
/// reaches once the per-syscall routine returns.
fn find_post_dispatch(code: &[u8], base: Va) -> Result<Va, Error> {
    let cs = Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .build()
        .map_err(|err| Error::Config(format!("failed to open disassembler: {err}")))?;

    let instructions = cs
        .disasm_all(code, base.0)
        .map_err(|err| Error::Config(format!("failed to disassemble entry handler: {err}")))?;

    for instruction in instructions.iter() {
        if instruction.mnemonic() == Some("call") {
            return Ok(Va(instruction.address() + instruction.bytes().len() as u64));
        }
    }

    Err(Error::Config(
        "no dispatch call within the syscall entry handler".into(),
    ))
}

fn read_kernel_u64<D>(driver: &D, va: Va) -> Result<u64, Error>
where
    D: Driver,
{
    let pa = driver.translate_kernel(va)?;
    driver.read_u64(pa)
}

fn read_kernel_u32<D>(driver: &D, va: Va) -> Result<u32, Error>
where
    D: Driver,
{
    let pa = driver.translate_kernel(va)?;
    let mut buffer = [0u8; 4];
    driver.read(pa, &mut buffer)?;
    Ok(u32::from_le_bytes(buffer))
}

/// Logs call and return of a traced syscall, with the first three
/// argument registers of the System V syscall convention.
struct LogHandler {
    name: &'static str,
}

impl SyscallHandler for LogHandler {
    fn on_call(&self, event: &CallEvent) -> Option<Box<dyn Any>> {
        tracing::info!(
            target: "slatrace::syscalls",
            syscall = self.name,
            pid = %event.pid,
            thread = %event.thread_id,
            arg0 = event.registers.rdi,
            arg1 = event.registers.rsi,
            arg2 = event.registers.rdx,
            "enter"
        );

        None
    }

    fn on_return(&self, event: &ReturnEvent, _state: Option<Box<dyn Any>>) {
        tracing::info!(
            target: "slatrace::syscalls",
            syscall = self.name,
            pid = %event.pid,
            ret = event.registers.rax as i64,
            "exit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_the_instruction_after_the_dispatch_call() {
        // swapgs; mov rdi, rsp; call -0x1000; nop
        let code: &[u8] = &[
            0x0F, 0x01, 0xF8, // swapgs
            0x48, 0x89, 0xE7, // mov rdi, rsp
            0xE8, 0xFB, 0xEF, 0xFF, 0xFF, // call rel32
            0x90, // nop
        ];

        let base = Va(0xFFFF_FFFF_8100_0000);
        let found = find_post_dispatch(code, base).unwrap();
        assert_eq!(found, Va(base.0 + 11));
    }

    #[test]
    fn errors_without_a_call() {
        let code = [0x90u8; 64];
        assert!(find_post_dispatch(&code, Va(0xFFFF_FFFF_8100_0000)).is_err());
    }

    #[test]
    fn callback_table_prefers_modern_symbols() {
        let map = "\
ffffffff81001000 T __x64_sys_read
ffffffff81002000 T sys_write
ffffffff82211780 D init_task
";
        let adapter = LinuxOs::new(SymbolTable::from_reader(map.as_bytes()).unwrap());
        let table = adapter.default_callbacks();

        let symbols: Vec<_> = table.iter().map(|entry| entry.symbol.as_str()).collect();
        assert!(symbols.contains(&"__x64_sys_read"));
        assert!(symbols.contains(&"sys_write"));
        assert_eq!(table.len(), 2);
    }
}
