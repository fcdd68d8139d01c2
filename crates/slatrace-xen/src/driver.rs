use std::{cell::RefCell, collections::HashMap, os::fd::AsRawFd as _, time::Duration};

use slatrace_core::{
    DomainInfo, Driver, Error as CoreError, EventMonitor, EventResponse, Gfn, MemoryAccess, Pa,
    Registers, TraceEvent, Va, VcpuId, View, PAGE_SIZE,
};
use xen::{
    ctrl::VmEventRing, XenAltP2M, XenAltP2MView, XenControl, XenDeviceModel, XenDomain,
    XenDomainId, XenDomainInfo, XenEventChannelPort, XenForeignMemory, XenForeignMemoryProtection,
    XenMonitor, XenStore,
};

use crate::{
    paging::{self, TranslationCache},
    regs, Error,
};

/// slatrace driver for the Xen hypervisor.
pub struct XenDriver {
    pub(crate) domain: XenDomain<xen::arch::x86::Amd64>,
    pub(crate) devicemodel: XenDeviceModel,
    pub(crate) monitor: XenMonitor,
    pub(crate) altp2m: XenAltP2M,
    pub(crate) evtchn: XenEventChannelPort,
    pub(crate) foreign_memory: XenForeignMemory,
    pub(crate) info: XenDomainInfo,

    /// Root of the kernel's page-table hierarchy, captured at attach time.
    /// LSTAR-reachable kernel mappings are stable for the lifetime of the
    /// boot, so one snapshot suffices.
    kernel_root: Pa,

    ring: RefCell<VmEventRing>,
    views: RefCell<HashMap<u16, XenAltP2MView>>,
    cache: TranslationCache,
}

impl XenDriver {
    /// Attaches to a running domain.
    pub fn new(domain_id: XenDomainId) -> Result<Self, Error> {
        let xc = XenControl::new()?;
        let domain = xc.domain(domain_id)?;

        let devicemodel = domain.device_model()?;
        let (monitor, ring) = domain.monitor()?;
        let altp2m = domain.altp2m()?;
        let evtchn = monitor.channel()?;
        let foreign_memory = XenForeignMemory::new()?;
        let info = domain.info()?;

        domain.pause()?;
        let context = domain.get_context_cpu(0u16.into())?;
        let kernel_root = Pa(context.cr3 & 0x0000_FFFF_FFFF_F000);
        domain.unpause()?;

        tracing::debug!(?domain_id, %kernel_root, "attached to domain");

        Ok(Self {
            domain,
            devicemodel,
            monitor,
            altp2m,
            evtchn,
            foreign_memory,
            info,
            kernel_root,
            ring: RefCell::new(ring),
            views: RefCell::new(HashMap::new()),
            cache: TranslationCache::new(),
        })
    }

    /// Resolves a domain name to its identifier through the Xen store.
    pub fn lookup_domain(name: &str) -> Result<Option<XenDomainId>, Error> {
        Ok(XenStore::domain_id_from_name(name)?)
    }

    fn read_inner(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), Error> {
        let mut position = 0usize;

        while position < buffer.len() {
            let address = pa + position as u64;
            let offset = address.offset() as usize;
            let size = (buffer.len() - position).min(PAGE_SIZE as usize - offset);

            let page = self.foreign_memory.map(
                self.domain.id(),
                XenForeignMemoryProtection::READ,
                &[u64::from(address.gfn())],
                None,
            )?;

            buffer[position..position + size].copy_from_slice(&page[offset..offset + size]);
            position += size;
        }

        Ok(())
    }

    fn write_inner(&self, pa: Pa, buffer: &[u8]) -> Result<(), Error> {
        let mut position = 0usize;

        while position < buffer.len() {
            let address = pa + position as u64;
            let offset = address.offset() as usize;
            let size = (buffer.len() - position).min(PAGE_SIZE as usize - offset);

            let mut page = self.foreign_memory.map(
                self.domain.id(),
                XenForeignMemoryProtection::WRITE,
                &[u64::from(address.gfn())],
                None,
            )?;

            page[offset..offset + size].copy_from_slice(&buffer[position..position + size]);
            position += size;
        }

        Ok(())
    }

    fn wait_for_event_inner(
        &self,
        timeout: Duration,
        mut handler: impl FnMut(&TraceEvent) -> EventResponse,
    ) -> Result<(), Error> {
        let mut fds = [libc::pollfd {
            fd: self.evtchn.as_raw_fd(),
            events: libc::POLLIN | libc::POLLERR,
            revents: 0,
        }];

        let timeout = timeout
            .as_millis()
            .try_into()
            .map_err(|_| Error::InvalidTimeout)?;

        let poll_result = unsafe { libc::poll(fds.as_mut_ptr() as _, fds.len() as _, timeout) };

        match poll_result {
            0 => return Err(Error::Timeout),
            -1 => return Err(Error::Io(std::io::Error::last_os_error())),
            _ => (),
        }

        self.evtchn.wait()?;

        while self.ring.borrow().has_unconsumed_requests() {
            // The guest may have rewritten its page tables since the last
            // delivery; start every event from clean translations.
            self.cache.flush();

            let mut event = self.ring.borrow_mut().get_request();
            self.process_event(&mut event, &mut handler)?;
            self.ring.borrow_mut().put_response(event);
        }

        self.evtchn.notify()?;

        Ok(())
    }

    fn view_handle<T>(
        &self,
        view: View,
        f: impl FnOnce(&XenAltP2MView) -> Result<T, xen::XenError>,
    ) -> Result<T, Error> {
        match self.views.borrow().get(&view.0) {
            Some(view) => Ok(f(view)?),
            None => Err(Error::ViewNotFound),
        }
    }
}

fn access_to_xen(access: MemoryAccess) -> xen::MemoryAccess {
    let r = access.contains(MemoryAccess::R);
    let w = access.contains(MemoryAccess::W);
    let x = access.contains(MemoryAccess::X);

    match (r, w, x) {
        (false, false, false) => xen::MemoryAccess::N,
        (true, false, false) => xen::MemoryAccess::R,
        (false, true, false) => xen::MemoryAccess::W,
        (true, true, false) => xen::MemoryAccess::RW,
        (false, false, true) => xen::MemoryAccess::X,
        (true, false, true) => xen::MemoryAccess::RX,
        (false, true, true) => xen::MemoryAccess::WX,
        (true, true, true) => xen::MemoryAccess::RWX,
    }
}

impl Driver for XenDriver {
    fn info(&self) -> Result<DomainInfo, CoreError> {
        Ok(DomainInfo {
            vcpus: self.info.max_vcpu_id + 1,
            memory_size: self.info.max_pages * PAGE_SIZE,
            // HVM guests traced here run in long mode.
            address_width: 8,
        })
    }

    fn pause(&self) -> Result<(), CoreError> {
        Ok(self.domain.pause().map_err(Error::Xen)?)
    }

    fn resume(&self) -> Result<(), CoreError> {
        Ok(self.domain.unpause().map_err(Error::Xen)?)
    }

    fn registers(&self, vcpu: VcpuId) -> Result<Registers, CoreError> {
        let context = self
            .domain
            .get_context_cpu(vcpu.0.into())
            .map_err(Error::Xen)?;

        Ok(regs::registers_from_context(&context))
    }

    fn read(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), CoreError> {
        Ok(self.read_inner(pa, buffer)?)
    }

    fn write(&self, pa: Pa, buffer: &[u8]) -> Result<(), CoreError> {
        Ok(self.write_inner(pa, buffer)?)
    }

    fn translate_kernel(&self, va: Va) -> Result<Pa, CoreError> {
        if let Some(pa) = self.cache.get(va) {
            return Ok(pa);
        }

        let translation = paging::translate(va, self.kernel_root, |gfn| {
            let mut buffer = [0u8; PAGE_SIZE as usize];
            self.read_inner(Pa::from_parts(gfn, 0), &mut buffer).ok()?;
            Some(buffer)
        });

        match translation {
            Some(pa) => {
                self.cache.put(va, pa);
                Ok(pa)
            }
            None => Err(CoreError::Translation(va)),
        }
    }

    fn set_max_mem(&self, bytes: u64) -> Result<(), CoreError> {
        Ok(self.domain.set_max_mem(bytes / 1024).map_err(Error::Xen)?)
    }

    fn increase_reservation(&self) -> Result<Gfn, CoreError> {
        // The frame past the current maximum; it becomes real once
        // populated, which the engine does before asking for another.
        let gfn = Gfn(self.domain.maximum_gpfn().map_err(Error::Xen)? + 1);
        Ok(gfn)
    }

    fn populate_frame(&self, gfn: Gfn) -> Result<(), CoreError> {
        Ok(self
            .domain
            .populate_physmap_exact(0, 0, &[u64::from(gfn)])
            .map_err(Error::Xen)?)
    }

    fn decrease_reservation(&self, gfn: Gfn) -> Result<(), CoreError> {
        Ok(self
            .domain
            .decrease_reservation_exact(0, &[u64::from(gfn)])
            .map_err(Error::Xen)?)
    }

    fn altp2m_enable(&self) -> Result<(), CoreError> {
        // The facility is switched on when the alt-p2m handle is acquired
        // at construction; nothing further to arm here.
        tracing::debug!("alternate p2m available");
        Ok(())
    }

    fn altp2m_disable(&self) -> Result<(), CoreError> {
        self.altp2m.reset_view().map_err(Error::Xen)?;
        self.views.borrow_mut().clear();
        Ok(())
    }

    fn create_view(&self) -> Result<View, CoreError> {
        let view = self
            .altp2m
            .create_view(xen::MemoryAccess::RWX)
            .map_err(Error::Xen)?;

        let id = view.id();
        self.views.borrow_mut().insert(id, view);

        Ok(View(id))
    }

    fn destroy_view(&self, view: View) -> Result<(), CoreError> {
        if view == View::DEFAULT {
            return Ok(());
        }

        match self.views.borrow_mut().remove(&view.0) {
            // The view is destroyed when the handle goes out of scope.
            Some(_view) => Ok(()),
            None => Err(CoreError::ViewNotFound),
        }
    }

    fn switch_to_view(&self, view: View) -> Result<(), CoreError> {
        if view == View::DEFAULT {
            return Ok(self.altp2m.reset_view().map_err(Error::Xen)?);
        }

        Ok(self.view_handle(view, |view| view.switch())?)
    }

    fn change_view_gfn(&self, view: View, old_gfn: Gfn, new_gfn: Gfn) -> Result<(), CoreError> {
        Ok(self.view_handle(view, |view| {
            view.change_gfn(u64::from(old_gfn), u64::from(new_gfn))
        })?)
    }

    fn reset_view_gfn(&self, view: View, gfn: Gfn) -> Result<(), CoreError> {
        Ok(self.view_handle(view, |view| view.change_gfn(u64::from(gfn), u64::MAX))?)
    }

    fn set_memory_access(&self, gfn: Gfn, view: View, access: MemoryAccess) -> Result<(), CoreError> {
        tracing::trace!(%gfn, %view, %access, "set memory access");

        if view == View::DEFAULT {
            return Ok(self
                .domain
                .set_mem_access(u64::from(gfn), access_to_xen(access))
                .map_err(Error::Xen)?);
        }

        Ok(self.view_handle(view, |view| {
            view.set_mem_access(u64::from(gfn), access_to_xen(access))
        })?)
    }

    fn monitor_enable(&self, monitor: EventMonitor) -> Result<(), CoreError> {
        match monitor {
            EventMonitor::SoftwareBreakpoint => {
                self.monitor.software_breakpoint(true).map_err(Error::Xen)?
            }
            EventMonitor::Singlestep => self.monitor.singlestep(true).map_err(Error::Xen)?,
        }

        Ok(())
    }

    fn monitor_disable(&self, monitor: EventMonitor) -> Result<(), CoreError> {
        match monitor {
            EventMonitor::SoftwareBreakpoint => {
                self.monitor.software_breakpoint(false).map_err(Error::Xen)?
            }
            EventMonitor::Singlestep => {
                // Clear any VCPU still inside a single-step window before
                // turning delivery off.
                for vcpu in 0..=self.info.max_vcpu_id {
                    let _ = self.domain.debug_control(vcpu.into(), 0);
                }

                self.monitor.singlestep(false).map_err(Error::Xen)?
            }
        }

        Ok(())
    }

    fn wait_for_event(
        &self,
        timeout: Duration,
        handler: impl FnMut(&TraceEvent) -> EventResponse,
    ) -> Result<(), CoreError> {
        Ok(self.wait_for_event_inner(timeout, handler)?)
    }
}
