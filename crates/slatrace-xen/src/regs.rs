//! Register conversion between the Xen context blocks and the engine.

use slatrace_core::{GpRegisters, Registers};
use xen::ctrl::VmEventRegsX86;

/// Builds the engine's register image from a vm_event register block.
pub fn registers_from_event(regs: &VmEventRegsX86) -> Registers {
    Registers {
        rax: regs.rax,
        rbx: regs.rbx,
        rcx: regs.rcx,
        rdx: regs.rdx,
        rbp: regs.rbp,
        rsi: regs.rsi,
        rdi: regs.rdi,
        rsp: regs.rsp,
        r8: regs.r8,
        r9: regs.r9,
        r10: regs.r10,
        r11: regs.r11,
        r12: regs.r12,
        r13: regs.r13,
        r14: regs.r14,
        r15: regs.r15,
        rip: regs.rip,
        rflags: regs.rflags,
        cr3: regs.cr3,
        msr_lstar: regs.msr_lstar,
    }
}

/// Builds the engine's register image from a full VCPU context.
pub fn registers_from_context(regs: &xen::arch::x86::Registers) -> Registers {
    Registers {
        rax: regs.rax,
        rbx: regs.rbx,
        rcx: regs.rcx,
        rdx: regs.rdx,
        rbp: regs.rbp,
        rsi: regs.rsi,
        rdi: regs.rdi,
        rsp: regs.rsp,
        r8: regs.r8,
        r9: regs.r9,
        r10: regs.r10,
        r11: regs.r11,
        r12: regs.r12,
        r13: regs.r13,
        r14: regs.r14,
        r15: regs.r15,
        rip: regs.rip,
        rflags: regs.rflags,
        cr3: regs.cr3,
        msr_lstar: regs.msr_lstar,
    }
}

/// Applies a general-purpose register update onto the event's register
/// block in place.
///
/// Only the general-purpose state is rewritten; control, segment and MSR
/// state stays whatever the VCPU already holds.
pub fn apply_gp_registers(regs: &mut VmEventRegsX86, gp: &GpRegisters) {
    regs.rax = gp.rax;
    regs.rbx = gp.rbx;
    regs.rcx = gp.rcx;
    regs.rdx = gp.rdx;
    regs.rbp = gp.rbp;
    regs.rsi = gp.rsi;
    regs.rdi = gp.rdi;
    regs.rsp = gp.rsp;
    regs.r8 = gp.r8;
    regs.r9 = gp.r9;
    regs.r10 = gp.r10;
    regs.r11 = gp.r11;
    regs.r12 = gp.r12;
    regs.r13 = gp.r13;
    regs.r14 = gp.r14;
    regs.r15 = gp.r15;
    regs.rip = gp.rip;
    regs.rflags = gp.rflags;
}
