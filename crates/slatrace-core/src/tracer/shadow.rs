//! Shadow frames, page records and the breakpoint registry.

use std::{collections::HashMap, rc::Rc};

use crate::{
    Driver, Error, Gfn, MemoryAccess, Pa, SyscallHandler, Va, View, BREAKPOINT, PAGE_SIZE,
};

/// One traced kernel entry point within a shadow page.
pub(crate) struct BreakpointRecord {
    pub offset: u16,
    pub handler: Rc<dyn SyscallHandler>,
}

/// One instrumented original kernel-code frame.
///
/// The shadow frame is a mutable copy of the original page with breakpoint
/// bytes emplaced; the shadow view maps it in place of the original.
pub(crate) struct PageRecord {
    pub frame: Gfn,
    pub shadow_frame: Gfn,
    pub children: HashMap<u16, BreakpointRecord>,
}

/// The shadow table and breakpoint registry.
///
/// Also owns the reservation accounting: the guest's reservation always
/// equals the initial size plus one page per live record.
pub(crate) struct ShadowPages {
    view: View,

    /// Original frame to shadow frame.
    translation: HashMap<Gfn, Gfn>,

    /// Shadow frame to its record.
    records: HashMap<Gfn, PageRecord>,

    curr_mem_size: u64,
}

impl ShadowPages {
    pub fn new(view: View, init_mem_size: u64) -> Self {
        Self {
            view,
            translation: HashMap::new(),
            records: HashMap::new(),
            curr_mem_size: init_mem_size,
        }
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.curr_mem_size
    }

    pub fn page_count(&self) -> usize {
        self.records.len()
    }

    pub fn breakpoint_count(&self) -> usize {
        self.records.values().map(|r| r.children.len()).sum()
    }

    /// Returns the breakpoint covering `pa`, if any.
    pub fn lookup(&self, pa: Pa) -> Option<&BreakpointRecord> {
        let shadow = self.translation.get(&pa.gfn())?;
        let record = self.records.get(shadow)?;
        record.children.get(&(pa.offset() as u16))
    }

    /// Installs a breakpoint at the kernel virtual address `va`.
    ///
    /// The engine maps are only touched once every hypervisor-side step has
    /// succeeded. A breakpoint already present at the address wins; the
    /// install is idempotent.
    pub fn install<D>(
        &mut self,
        driver: &D,
        va: Va,
        handler: Rc<dyn SyscallHandler>,
    ) -> Result<(), Error>
    where
        D: Driver,
    {
        let pa = driver.translate_kernel(va)?;
        let frame = pa.gfn();
        let offset = pa.offset() as u16;

        let record = self.ensure_page_record(driver, frame)?;
        if record.children.contains_key(&offset) {
            tracing::debug!(%va, offset, "breakpoint already present");
            return Ok(());
        }

        let shadow_frame = record.shadow_frame;
        driver.write_u8(Pa::from_parts(shadow_frame, offset as u64), BREAKPOINT)?;
        record.children.insert(offset, BreakpointRecord { offset, handler });

        tracing::info!(%va, %frame, %shadow_frame, offset, "breakpoint installed");
        Ok(())
    }

    /// Returns the record instrumenting `frame`, creating it if necessary.
    fn ensure_page_record<D>(&mut self, driver: &D, frame: Gfn) -> Result<&mut PageRecord, Error>
    where
        D: Driver,
    {
        if let Some(shadow) = self.translation.get(&frame).copied() {
            return self
                .records
                .get_mut(&shadow)
                .ok_or(Error::Allocation("shadow mapping without a page record"));
        }

        let shadow = self.allocate_shadow_frame(driver)?;
        if let Err(err) = self.prime_shadow_frame(driver, frame, shadow) {
            self.release_shadow_frame(driver, shadow);
            return Err(err);
        }

        tracing::debug!(%frame, %shadow, view = %self.view, "instrumenting kernel frame");

        self.translation.insert(frame, shadow);
        Ok(self.records.entry(shadow).or_insert(PageRecord {
            frame,
            shadow_frame: shadow,
            children: HashMap::new(),
        }))
    }

    /// Copies the original page into the shadow frame, maps it into the
    /// shadow view and arms the read/write watch on the original frame.
    ///
    /// The watch is what surfaces guest integrity checks of the page as
    /// memory events while the shadow view is active.
    fn prime_shadow_frame<D>(&self, driver: &D, frame: Gfn, shadow: Gfn) -> Result<(), Error>
    where
        D: Driver,
    {
        let mut content = [0u8; PAGE_SIZE as usize];
        driver.read(Pa::from_parts(frame, 0), &mut content)?;
        driver.write(Pa::from_parts(shadow, 0), &content)?;

        driver.change_view_gfn(self.view, frame, shadow)?;

        if let Err(err) = driver.set_memory_access(frame, self.view, MemoryAccess::X) {
            let _ = driver.reset_view_gfn(self.view, frame);
            return Err(err);
        }

        Ok(())
    }

    /// Grows the guest's reservation by one page and returns the new frame.
    ///
    /// Unwinds on every sub-step failure so `curr_mem_size` reflects the
    /// actual reservation.
    fn allocate_shadow_frame<D>(&mut self, driver: &D) -> Result<Gfn, Error>
    where
        D: Driver,
    {
        let proposed = self.curr_mem_size + PAGE_SIZE;
        if let Err(err) = driver.set_max_mem(proposed) {
            tracing::error!(%err, proposed, "failed to raise the guest memory limit");
            return Err(Error::Allocation("memory limit"));
        }
        self.curr_mem_size = proposed;

        let gfn = match driver.increase_reservation() {
            Ok(gfn) => gfn,
            Err(err) => {
                tracing::error!(%err, "failed to increase the guest reservation");
                self.unwind_allocation(driver, None);
                return Err(Error::Allocation("reservation"));
            }
        };

        if let Err(err) = driver.populate_frame(gfn) {
            tracing::error!(%err, %gfn, "failed to populate the shadow frame");
            self.unwind_allocation(driver, Some(gfn));
            return Err(Error::Allocation("populate"));
        }

        Ok(gfn)
    }

    fn unwind_allocation<D>(&mut self, driver: &D, gfn: Option<Gfn>)
    where
        D: Driver,
    {
        if let Some(gfn) = gfn {
            let _ = driver.decrease_reservation(gfn);
        }
        self.curr_mem_size -= PAGE_SIZE;
        let _ = driver.set_max_mem(self.curr_mem_size);
    }

    /// Releases a fully allocated shadow frame that never became a record.
    fn release_shadow_frame<D>(&mut self, driver: &D, gfn: Gfn)
    where
        D: Driver,
    {
        if let Err(err) = driver.decrease_reservation(gfn) {
            tracing::warn!(%err, %gfn, "failed to release a shadow frame");
        }
        self.curr_mem_size -= PAGE_SIZE;
        let _ = driver.set_max_mem(self.curr_mem_size);
    }

    /// Tears down every record: restores the original bytes in the shadow
    /// frames, stops monitoring, unmaps the shadow slots and returns the
    /// frames to the hypervisor.
    ///
    /// Runs under guest pause. Returns the number of failed restoration
    /// steps; failures are logged and teardown continues.
    pub fn clear<D>(&mut self, driver: &D) -> usize
    where
        D: Driver,
    {
        let mut failures = 0;

        for (_, mut record) in self.records.drain() {
            for (_, child) in record.children.drain() {
                let original = Pa::from_parts(record.frame, child.offset as u64);
                let shadowed = Pa::from_parts(record.shadow_frame, child.offset as u64);

                match driver.read_u8(original) {
                    Ok(byte) => {
                        if let Err(err) = driver.write_u8(shadowed, byte) {
                            tracing::warn!(%err, %shadowed, "failed to restore breakpoint byte");
                            failures += 1;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, %original, "failed to read original byte");
                        failures += 1;
                    }
                }
            }

            if let Err(err) = driver.set_memory_access(record.frame, self.view, MemoryAccess::RWX)
            {
                tracing::warn!(%err, frame = %record.frame, "failed to stop monitoring");
                failures += 1;
            }

            if let Err(err) = driver.reset_view_gfn(self.view, record.frame) {
                tracing::warn!(%err, frame = %record.frame, "failed to unmap shadow frame");
                failures += 1;
            }

            if let Err(err) = driver.decrease_reservation(record.shadow_frame) {
                tracing::warn!(
                    %err,
                    shadow_frame = %record.shadow_frame,
                    "failed to free shadow frame"
                );
                failures += 1;
            }

            self.curr_mem_size -= PAGE_SIZE;

            tracing::debug!(
                frame = %record.frame,
                shadow_frame = %record.shadow_frame,
                "shadow frame torn down"
            );
        }

        self.translation.clear();
        failures
    }
}
