//! A synthetic guest backing the engine tests.
//!
//! The mock driver keeps guest memory, the view mappings, the access
//! permissions and the reservation bookkeeping in plain maps, and journals
//! every control operation so tests can assert on the engine's behavior.

// Each test binary uses its own slice of this fixture.
#![allow(dead_code)]

use std::{
    any::Any,
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::Rc,
    time::Duration,
};

use slatrace_core::{
    CallEvent, CallbackEntry, DomainInfo, Driver, Error, EventMonitor, EventReason, EventResponse,
    Gfn, MemoryAccess, OsAdapter, Pa, ProcessId, Registers, ReturnEvent, SyscallHandler,
    TraceEvent, Tracer, Va, VcpuId, View, PAGE_MASK, PAGE_SIZE,
};

/// Base of the guest's syscall entry handler (the value of `MSR_LSTAR`).
pub const LSTAR: Va = Va(0xFFFF_FFFF_8100_0000);
pub const ENTRY_GFN: Gfn = Gfn(0x10);

/// Offset of the pre-existing breakpoint byte within the entry page.
pub const TRAMPOLINE_OFFSET: u64 = 0x40;

/// The instruction following the dispatch call in the entry handler.
pub const RETURN_POINT: Va = Va(LSTAR.0 + 0x21);

/// A kernel text page holding the traced functions.
pub const TEXT_VA: Va = Va(0xFFFF_FFFF_8100_1000);
pub const TEXT_GFN: Gfn = Gfn(0x11);

/// Two traced entry points within the text page.
pub const SYM_A: Va = Va(TEXT_VA.0 + 0x234);
pub const SYM_B: Va = Va(TEXT_VA.0 + 0x400);

/// Original first bytes of the traced functions.
pub const SYM_A_BYTE: u8 = 0x55;
pub const SYM_B_BYTE: u8 = 0x48;

/// A kernel stack page and a stack pointer within it.
pub const STACK_VA: Va = Va(0xFFFF_8800_DEAD_B000);
pub const STACK_GFN: Gfn = Gfn(0x20);
pub const RSP: u64 = 0xFFFF_8800_DEAD_BE00;

pub const INIT_MEM_SIZE: u64 = 64 << 20;

pub fn trampoline() -> Va {
    Va(LSTAR.0 + TRAMPOLINE_OFFSET)
}

#[derive(Default)]
struct Inner {
    memory: HashMap<Gfn, Box<[u8; PAGE_SIZE as usize]>>,
    page_map: HashMap<u64, Gfn>,
    registers: HashMap<u16, Registers>,

    max_mem: u64,
    next_gfn: u64,
    reserved: HashSet<Gfn>,

    altp2m_enabled: bool,
    next_view: u16,
    views: HashSet<u16>,
    active_view: View,
    view_maps: HashMap<(u16, Gfn), Gfn>,
    access: HashMap<(u16, Gfn), MemoryAccess>,
    monitors: HashSet<EventMonitor>,

    pause_depth: i32,

    fail_populate: bool,
}

pub struct MockDriver {
    inner: RefCell<Inner>,
}

impl MockDriver {
    pub fn new() -> Self {
        let driver = Self {
            inner: RefCell::new(Inner {
                max_mem: INIT_MEM_SIZE,
                next_gfn: 0x8000,
                next_view: 1,
                ..Inner::default()
            }),
        };

        // Entry page: NOPs with one stray breakpoint byte for the
        // trampoline scan to find.
        let mut entry = [0x90u8; PAGE_SIZE as usize];
        entry[TRAMPOLINE_OFFSET as usize] = 0xCC;
        driver.map_page(LSTAR, ENTRY_GFN, &entry);

        // Text page with the traced function bodies.
        let mut text = [0x90u8; PAGE_SIZE as usize];
        text[SYM_A.offset() as usize] = SYM_A_BYTE;
        text[SYM_B.offset() as usize] = SYM_B_BYTE;
        driver.map_page(TEXT_VA, TEXT_GFN, &text);

        // Stack page whose return slot holds the expected return point.
        let mut stack = [0u8; PAGE_SIZE as usize];
        let slot = (RSP & !PAGE_MASK) as usize;
        stack[slot..slot + 8].copy_from_slice(&RETURN_POINT.0.to_le_bytes());
        driver.map_page(STACK_VA, STACK_GFN, &stack);

        let registers = Registers {
            msr_lstar: LSTAR.0,
            ..Registers::default()
        };
        driver.inner.borrow_mut().registers.insert(0, registers);

        driver
    }

    pub fn map_page(&self, va: Va, gfn: Gfn, content: &[u8; PAGE_SIZE as usize]) {
        let mut inner = self.inner.borrow_mut();
        inner.memory.insert(gfn, Box::new(*content));
        inner.page_map.insert(va.0 & PAGE_MASK, gfn);
    }

    pub fn read_byte(&self, pa: Pa) -> u8 {
        self.inner.borrow().memory[&pa.gfn()][pa.offset() as usize]
    }

    pub fn read_word(&self, pa: Pa) -> u64 {
        let inner = self.inner.borrow();
        let page = &inner.memory[&pa.gfn()];
        let offset = pa.offset() as usize;
        u64::from_le_bytes(page[offset..offset + 8].try_into().unwrap())
    }

    pub fn shadow_of(&self, view: View, gfn: Gfn) -> Option<Gfn> {
        self.inner.borrow().view_maps.get(&(view.0, gfn)).copied()
    }

    pub fn access_of(&self, view: View, gfn: Gfn) -> Option<MemoryAccess> {
        self.inner.borrow().access.get(&(view.0, gfn)).copied()
    }

    pub fn active_view(&self) -> View {
        self.inner.borrow().active_view
    }

    pub fn max_mem(&self) -> u64 {
        self.inner.borrow().max_mem
    }

    pub fn frame_exists(&self, gfn: Gfn) -> bool {
        self.inner.borrow().memory.contains_key(&gfn)
    }

    pub fn monitoring(&self, monitor: EventMonitor) -> bool {
        self.inner.borrow().monitors.contains(&monitor)
    }

    pub fn paused(&self) -> bool {
        self.inner.borrow().pause_depth > 0
    }

    pub fn fail_next_populate(&self) {
        self.inner.borrow_mut().fail_populate = true;
    }
}

impl Driver for MockDriver {
    fn info(&self) -> Result<DomainInfo, Error> {
        Ok(DomainInfo {
            vcpus: 2,
            memory_size: INIT_MEM_SIZE,
            address_width: 8,
        })
    }

    fn pause(&self) -> Result<(), Error> {
        self.inner.borrow_mut().pause_depth += 1;
        Ok(())
    }

    fn resume(&self) -> Result<(), Error> {
        self.inner.borrow_mut().pause_depth -= 1;
        Ok(())
    }

    fn registers(&self, vcpu: VcpuId) -> Result<Registers, Error> {
        self.inner
            .borrow()
            .registers
            .get(&vcpu.0)
            .copied()
            .ok_or(Error::NotSupported)
    }

    fn read(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), Error> {
        let inner = self.inner.borrow();
        let mut position = 0usize;

        while position < buffer.len() {
            let address = pa + position as u64;
            let page = inner.memory.get(&address.gfn()).ok_or(Error::OutOfBounds)?;
            let offset = address.offset() as usize;
            let size = (buffer.len() - position).min(PAGE_SIZE as usize - offset);
            buffer[position..position + size].copy_from_slice(&page[offset..offset + size]);
            position += size;
        }

        Ok(())
    }

    fn write(&self, pa: Pa, buffer: &[u8]) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let mut position = 0usize;

        while position < buffer.len() {
            let address = pa + position as u64;
            let page = inner
                .memory
                .get_mut(&address.gfn())
                .ok_or(Error::OutOfBounds)?;
            let offset = address.offset() as usize;
            let size = (buffer.len() - position).min(PAGE_SIZE as usize - offset);
            page[offset..offset + size].copy_from_slice(&buffer[position..position + size]);
            position += size;
        }

        Ok(())
    }

    fn translate_kernel(&self, va: Va) -> Result<Pa, Error> {
        let inner = self.inner.borrow();
        let gfn = inner
            .page_map
            .get(&(va.0 & PAGE_MASK))
            .ok_or(Error::Translation(va))?;
        Ok(Pa::from_parts(*gfn, va.offset()))
    }

    fn set_max_mem(&self, bytes: u64) -> Result<(), Error> {
        self.inner.borrow_mut().max_mem = bytes;
        Ok(())
    }

    fn increase_reservation(&self) -> Result<Gfn, Error> {
        let mut inner = self.inner.borrow_mut();
        let gfn = Gfn(inner.next_gfn);
        inner.next_gfn += 1;
        inner.reserved.insert(gfn);
        Ok(gfn)
    }

    fn populate_frame(&self, gfn: Gfn) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();

        if inner.fail_populate {
            inner.fail_populate = false;
            return Err(Error::NotSupported);
        }

        if !inner.reserved.contains(&gfn) {
            return Err(Error::OutOfBounds);
        }

        inner.memory.insert(gfn, Box::new([0u8; PAGE_SIZE as usize]));
        Ok(())
    }

    fn decrease_reservation(&self, gfn: Gfn) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.reserved.remove(&gfn);
        inner.memory.remove(&gfn);
        Ok(())
    }

    fn altp2m_enable(&self) -> Result<(), Error> {
        self.inner.borrow_mut().altp2m_enabled = true;
        Ok(())
    }

    fn altp2m_disable(&self) -> Result<(), Error> {
        self.inner.borrow_mut().altp2m_enabled = false;
        Ok(())
    }

    fn create_view(&self) -> Result<View, Error> {
        let mut inner = self.inner.borrow_mut();

        if !inner.altp2m_enabled {
            return Err(Error::NotSupported);
        }

        let view = inner.next_view;
        inner.next_view += 1;
        inner.views.insert(view);
        Ok(View(view))
    }

    fn destroy_view(&self, view: View) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();

        if !inner.views.remove(&view.0) {
            return Err(Error::ViewNotFound);
        }

        Ok(())
    }

    fn switch_to_view(&self, view: View) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();

        if view != View::DEFAULT && !inner.views.contains(&view.0) {
            return Err(Error::ViewNotFound);
        }

        inner.active_view = view;
        Ok(())
    }

    fn change_view_gfn(&self, view: View, old_gfn: Gfn, new_gfn: Gfn) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();

        if !inner.views.contains(&view.0) {
            return Err(Error::ViewNotFound);
        }

        inner.view_maps.insert((view.0, old_gfn), new_gfn);
        Ok(())
    }

    fn reset_view_gfn(&self, view: View, gfn: Gfn) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();

        if !inner.views.contains(&view.0) {
            return Err(Error::ViewNotFound);
        }

        inner.view_maps.remove(&(view.0, gfn));
        Ok(())
    }

    fn set_memory_access(&self, gfn: Gfn, view: View, access: MemoryAccess) -> Result<(), Error> {
        self.inner.borrow_mut().access.insert((view.0, gfn), access);
        Ok(())
    }

    fn monitor_enable(&self, monitor: EventMonitor) -> Result<(), Error> {
        self.inner.borrow_mut().monitors.insert(monitor);
        Ok(())
    }

    fn monitor_disable(&self, monitor: EventMonitor) -> Result<(), Error> {
        self.inner.borrow_mut().monitors.remove(&monitor);
        Ok(())
    }

    fn wait_for_event(
        &self,
        _timeout: Duration,
        _handler: impl FnMut(&TraceEvent) -> EventResponse,
    ) -> Result<(), Error> {
        Err(Error::Timeout)
    }
}

pub struct MockOs {
    pub symbols: HashMap<String, Va>,
    pub pids: HashMap<Pa, ProcessId>,
}

impl MockOs {
    pub fn new() -> Self {
        let mut symbols = HashMap::new();
        symbols.insert("sym_a".into(), SYM_A);
        symbols.insert("sym_b".into(), SYM_B);
        symbols.insert("sym_untranslatable".into(), Va(0xFFFF_FFFF_9000_0000));

        Self {
            symbols,
            pids: HashMap::new(),
        }
    }
}

impl OsAdapter<MockDriver> for MockOs {
    fn symbol_va(&self, symbol: &str) -> Option<Va> {
        self.symbols.get(symbol).copied()
    }

    fn return_point(&self, _driver: &MockDriver, _lstar: Va) -> Result<Va, Error> {
        Ok(RETURN_POINT)
    }

    fn process_id(&self, _driver: &MockDriver, root: Pa) -> Result<ProcessId, Error> {
        Ok(self.pids.get(&root).copied().unwrap_or(ProcessId(1)))
    }

    fn callback_table(&self) -> Vec<CallbackEntry> {
        Vec::new()
    }
}

/// Records every delivered callback and threads a token through the
/// call/return state.
pub struct RecordingHandler {
    pub token: u64,
    pub calls: Rc<RefCell<Vec<CallEvent>>>,
    pub returns: Rc<RefCell<Vec<(ReturnEvent, Option<u64>)>>>,
}

impl RecordingHandler {
    pub fn new(token: u64) -> Rc<Self> {
        Rc::new(Self {
            token,
            calls: Rc::new(RefCell::new(Vec::new())),
            returns: Rc::new(RefCell::new(Vec::new())),
        })
    }
}

impl SyscallHandler for RecordingHandler {
    fn on_call(&self, event: &CallEvent) -> Option<Box<dyn Any>> {
        self.calls.borrow_mut().push(*event);
        Some(Box::new(self.token))
    }

    fn on_return(&self, event: &ReturnEvent, state: Option<Box<dyn Any>>) {
        let token = state.and_then(|s| s.downcast::<u64>().ok()).map(|t| *t);
        self.returns.borrow_mut().push((*event, token));
    }
}

pub fn tracer() -> Tracer<MockDriver, MockOs> {
    Tracer::new(MockDriver::new(), MockOs::new()).expect("tracer")
}

pub fn breakpoint_event(vcpu: u16, gla: Va, rsp: u64) -> TraceEvent {
    let registers = Registers {
        rip: gla.0,
        rsp,
        cr3: 0x1AA000,
        msr_lstar: LSTAR.0,
        ..Registers::default()
    };

    TraceEvent::new(
        VcpuId(vcpu),
        registers,
        EventReason::Interrupt(slatrace_core::EventInterrupt { gla, gfn: Gfn(0) }),
    )
}

pub fn memory_event(vcpu: u16, pa: Pa, va: Va, access: MemoryAccess) -> TraceEvent {
    TraceEvent::new(
        VcpuId(vcpu),
        Registers::default(),
        EventReason::MemoryAccess(slatrace_core::EventMemoryAccess { pa, va, access }),
    )
}

pub fn singlestep_event(vcpu: u16) -> TraceEvent {
    TraceEvent::new(
        VcpuId(vcpu),
        Registers::default(),
        EventReason::Singlestep(slatrace_core::EventSinglestep { gfn: Gfn(0) }),
    )
}
