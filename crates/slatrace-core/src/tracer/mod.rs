//! The tracing engine: lifecycle, registration and the event loop.

mod calls;
mod dispatch;
mod shadow;

use std::{
    cell::RefCell,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use self::{
    calls::{CallInFlight, CallTable},
    shadow::ShadowPages,
};
use crate::{
    CallbackEntry, Driver, Error, EventMonitor, OsAdapter, SyscallHandler, Va, VcpuId, View,
    BREAKPOINT, PAGE_SIZE,
};

/// Upper bound on the number of VCPUs the engine serves.
pub const MAX_VCPUS: usize = 16;

/// How long one event wait blocks before the loop re-checks the
/// termination flag.
const EVENT_TIMEOUT: Duration = Duration::from_millis(500);

/// Engine state mutated from the event handlers.
///
/// Event delivery is serialized on the loop thread, so a `RefCell` is all
/// the synchronization this needs.
struct TracerState {
    shadow: ShadowPages,
    calls: CallTable,
    return_addr: Va,
    trampoline_addr: Va,
}

/// A syscall tracer bound to one running guest.
///
/// The engine presents an instrumented copy of the guest kernel's code
/// pages through an alternate SLAT view. Traced functions carry a one-byte
/// breakpoint in the shadow copy only; the guest's own view of its memory
/// never changes. Return paths are traced by hijacking the return slot on
/// the guest stack so the return lands on a breakpoint byte that already
/// exists in the kernel image.
///
/// Expected use: [`new`] → [`attach`]/[`attach_all`] → [`run`] (blocks
/// until [`quit`] is requested, typically from a signal handler observing
/// [`interrupt_flag`]) → [`quit`] → [`close`].
///
/// [`new`]: Tracer::new
/// [`attach`]: Tracer::attach
/// [`attach_all`]: Tracer::attach_all
/// [`run`]: Tracer::run
/// [`quit`]: Tracer::quit
/// [`close`]: Tracer::close
/// [`interrupt_flag`]: Tracer::interrupt_flag
pub struct Tracer<D, Os>
where
    D: Driver,
    Os: OsAdapter<D>,
{
    driver: D,
    os: Os,
    view: View,
    pointer_width: u64,
    init_mem_size: u64,
    interrupted: Arc<AtomicBool>,
    state: RefCell<TracerState>,
}

impl<D, Os> Tracer<D, Os>
where
    D: Driver,
    Os: OsAdapter<D>,
{
    /// Prepares a guest for tracing: enables the alternate-p2m facility
    /// and creates the (not yet active) shadow view, all under guest pause.
    pub fn new(driver: D, os: Os) -> Result<Self, Error> {
        let (view, init_mem_size, pointer_width) = {
            let _pause = PauseGuard::new(&driver)?;

            let info = driver.info()?;
            if info.vcpus as usize > MAX_VCPUS {
                return Err(Error::Config(format!(
                    "guest has {} VCPUs, at most {MAX_VCPUS} are supported",
                    info.vcpus
                )));
            }

            driver
                .altp2m_enable()
                .map_err(|err| Error::Config(format!("alternate p2m unavailable: {err}")))?;

            let view = driver.create_view()?;

            tracing::info!(
                %view,
                vcpus = info.vcpus,
                memory_size = info.memory_size,
                "shadow view created"
            );

            (view, info.memory_size, info.address_width)
        };

        Ok(Self {
            driver,
            os,
            view,
            pointer_width,
            init_mem_size,
            interrupted: Arc::new(AtomicBool::new(false)),
            state: RefCell::new(TracerState {
                shadow: ShadowPages::new(view, init_mem_size),
                calls: CallTable::new(),
                return_addr: Va(0),
                trampoline_addr: Va(0),
            }),
        })
    }

    /// The termination flag; share it with signal handlers. Setting it
    /// makes [`run`](Tracer::run) wind down within one wait period.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    /// Returns the underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Returns the OS adapter.
    pub fn os(&self) -> &Os {
        &self.os
    }

    /// The shadow view presented to the guest while tracing.
    pub fn view(&self) -> View {
        self.view
    }

    /// Number of calls whose returns are still outstanding.
    pub fn pending_calls(&self) -> usize {
        self.state.borrow().calls.len()
    }

    /// Number of kernel frames currently instrumented.
    pub fn instrumented_pages(&self) -> usize {
        self.state.borrow().shadow.page_count()
    }

    /// Number of breakpoints currently emplaced.
    pub fn breakpoints(&self) -> usize {
        self.state.borrow().shadow.breakpoint_count()
    }

    /// The guest's current reservation in bytes, as accounted by the
    /// engine. Always `init_mem_size + PAGE_SIZE ×` instrumented pages.
    pub fn reserved_bytes(&self) -> u64 {
        self.state.borrow().shadow.reserved_bytes()
    }

    /// Attaches callbacks to a named kernel function, under guest pause.
    pub fn attach(&self, symbol: &str, handler: Rc<dyn SyscallHandler>) -> Result<(), Error> {
        let _pause = PauseGuard::new(&self.driver)?;

        let va = self
            .os
            .symbol_va(symbol)
            .ok_or_else(|| Error::Symbol(symbol.into()))?;

        self.state
            .borrow_mut()
            .shadow
            .install(&self.driver, va, handler)?;

        tracing::info!(symbol, %va, "tracing kernel function");
        Ok(())
    }

    /// Attaches a whole callback table, skipping entries whose symbols
    /// cannot be resolved or translated. Returns the number attached.
    pub fn attach_all(&self, table: Vec<CallbackEntry>) -> usize {
        let mut count = 0;

        for entry in table {
            if self.interrupted.load(Ordering::Relaxed) {
                break;
            }

            match self.attach(&entry.symbol, entry.handler) {
                Ok(()) => count += 1,
                Err(err @ (Error::Symbol(_) | Error::Translation(_))) => {
                    tracing::warn!(symbol = %entry.symbol, %err, "skipping registration");
                }
                Err(err) => {
                    tracing::error!(symbol = %entry.symbol, %err, "registration failed");
                }
            }
        }

        count
    }

    /// Arms the engine: activates the shadow view, enables breakpoint and
    /// single-step delivery, and resolves the return point and the
    /// trampoline. Runs under guest pause. [`run`](Tracer::run) calls this
    /// first; it is separate so a harness can drive events itself.
    pub fn start(&self) -> Result<(), Error> {
        let _pause = PauseGuard::new(&self.driver)?;

        self.driver.switch_to_view(self.view)?;
        self.driver.monitor_enable(EventMonitor::SoftwareBreakpoint)?;
        self.driver.monitor_enable(EventMonitor::Singlestep)?;

        // LSTAR is constant across VCPUs.
        let lstar = Va(self.driver.registers(VcpuId(0))?.msr_lstar);

        let return_addr = self.os.return_point(&self.driver, lstar)?;
        let trampoline_addr = self.find_trampoline(lstar)?;

        let mut st = self.state.borrow_mut();
        st.return_addr = return_addr;
        st.trampoline_addr = trampoline_addr;

        tracing::info!(%lstar, %return_addr, %trampoline_addr, "syscall entry armed");
        Ok(())
    }

    /// Runs the event loop until the termination flag is set or a fatal
    /// driver error occurs.
    pub fn run(&self) -> Result<(), Error> {
        self.start()?;

        while !self.interrupted.load(Ordering::Relaxed) {
            match self
                .driver
                .wait_for_event(EVENT_TIMEOUT, |event| self.dispatch(event))
            {
                Ok(()) | Err(Error::Timeout) => {}
                Err(Error::Interrupted) => break,
                Err(err) => {
                    tracing::error!(%err, "fatal error while waiting for events");
                    return Err(err);
                }
            }
        }

        tracing::debug!("event loop stopped");
        Ok(())
    }

    /// Removes every trace of the engine from the guest: restores hijacked
    /// return slots, tears down all shadow frames and reactivates the
    /// default view. Sets the termination flag so [`run`](Tracer::run)
    /// exits.
    ///
    /// Restoration failures are logged and teardown continues; if any step
    /// failed the result reports how many.
    pub fn quit(&self) -> Result<(), Error> {
        let failures = {
            let _pause = PauseGuard::new(&self.driver)?;
            let mut st = self.state.borrow_mut();

            let return_addr = st.return_addr;
            let mut failures = st.calls.restore_all(&self.driver, return_addr);
            failures += st.shadow.clear(&self.driver);

            if let Err(err) = self.driver.switch_to_view(View::DEFAULT) {
                tracing::error!(%err, "failed to reactivate the default view");
                failures += 1;
            }

            failures
        };

        self.interrupted.store(true, Ordering::Relaxed);

        tracing::info!(failures, "guest instrumentation removed");

        if failures == 0 {
            Ok(())
        } else {
            Err(Error::Teardown(failures))
        }
    }

    /// Releases the hypervisor-side resources. Call after
    /// [`quit`](Tracer::quit); the guest keeps running without
    /// instrumentation.
    pub fn close(self) -> Result<(), Error> {
        let mut failures = 0;

        if let Err(err) = self.driver.pause() {
            tracing::warn!(%err, "failed to pause for teardown");
            failures += 1;
        }

        for monitor in [EventMonitor::Singlestep, EventMonitor::SoftwareBreakpoint] {
            if let Err(err) = self.driver.monitor_disable(monitor) {
                tracing::warn!(%err, ?monitor, "failed to disable monitor");
                failures += 1;
            }
        }

        if let Err(err) = self.driver.destroy_view(self.view) {
            tracing::warn!(%err, view = %self.view, "failed to destroy the shadow view");
            failures += 1;
        }

        if let Err(err) = self.driver.altp2m_disable() {
            tracing::warn!(%err, "failed to disable alternate p2m");
            failures += 1;
        }

        // The limit may stay stale on the hypervisor side regardless;
        // nothing more can be done about it from here.
        if let Err(err) = self.driver.set_max_mem(self.init_mem_size) {
            tracing::warn!(%err, "failed to restore the guest memory limit");
            failures += 1;
        }

        if let Err(err) = self.driver.resume() {
            tracing::warn!(%err, "failed to resume after teardown");
            failures += 1;
        }

        if failures == 0 {
            Ok(())
        } else {
            Err(Error::Teardown(failures))
        }
    }

    /// Scans the first page of the syscall entry handler for a pre-existing
    /// breakpoint byte and publishes its address.
    ///
    /// Re-using a byte that is already part of the kernel image (and
    /// unreachable in normal execution) means the return path needs no
    /// extra code page the guest could checksum.
    fn find_trampoline(&self, lstar: Va) -> Result<Va, Error> {
        let pa = self.driver.translate_kernel(lstar)?;

        let mut code = [0u8; PAGE_SIZE as usize];
        self.driver.read(pa, &mut code)?;

        match code.iter().position(|&byte| byte == BREAKPOINT) {
            Some(index) => Ok(lstar + index as u64),
            None => Err(Error::Config(
                "no breakpoint instruction within the syscall entry page".into(),
            )),
        }
    }
}

/// Pauses the guest on creation and resumes it on drop.
pub struct PauseGuard<'a, D>
where
    D: Driver,
{
    driver: &'a D,
}

impl<'a, D> PauseGuard<'a, D>
where
    D: Driver,
{
    /// Pauses the guest.
    pub fn new(driver: &'a D) -> Result<Self, Error> {
        driver.pause()?;
        Ok(Self { driver })
    }
}

impl<D> Drop for PauseGuard<'_, D>
where
    D: Driver,
{
    fn drop(&mut self) {
        if let Err(err) = self.driver.resume() {
            tracing::error!(%err, "failed to resume the guest");
        }
    }
}
