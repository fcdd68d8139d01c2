//! Orderly removal of every guest-visible modification.

mod common;

use common::*;
use slatrace_core::{Driver as _, Pa, Va, View};

#[test]
fn quit_restores_hijacked_return_slots() {
    let tracer = tracer();
    let handler = RecordingHandler::new(1);

    tracer.attach("sym_a", handler.clone()).unwrap();
    tracer.start().unwrap();

    // A call is in flight when the engine is asked to wind down.
    tracer.dispatch(&breakpoint_event(0, SYM_A, RSP));
    assert_eq!(tracer.pending_calls(), 1);

    let slot = tracer.driver().translate_kernel(Va(RSP)).unwrap();
    assert_eq!(tracer.driver().read_word(slot), trampoline().0);

    tracer.quit().unwrap();

    // The stack slot points back at the real return site, so the guest
    // thread will not fall into an unserviced trampoline.
    assert_eq!(tracer.driver().read_word(slot), RETURN_POINT.0);
    assert_eq!(tracer.pending_calls(), 0);

    // The return callback never fires for an abandoned call; its state is
    // simply dropped.
    assert!(handler.returns.borrow().is_empty());
}

#[test]
fn quit_restores_shadow_pages_and_reservation() {
    let tracer = tracer();

    tracer.attach("sym_a", RecordingHandler::new(1)).unwrap();
    tracer.attach("sym_b", RecordingHandler::new(2)).unwrap();
    tracer.start().unwrap();

    let view = tracer.view();
    let shadow = tracer.driver().shadow_of(view, TEXT_GFN).unwrap();

    tracer.quit().unwrap();

    let driver = tracer.driver();

    // Shadow bytes hold the original instructions again (the frame itself
    // is gone from the guest, but the restore happens first).
    assert!(!driver.frame_exists(shadow));

    // Original bytes were never touched.
    assert_eq!(
        driver.read_byte(Pa::from_parts(TEXT_GFN, SYM_A.offset())),
        SYM_A_BYTE
    );
    assert_eq!(
        driver.read_byte(Pa::from_parts(TEXT_GFN, SYM_B.offset())),
        SYM_B_BYTE
    );

    // The shadow mapping and the watch are gone, the default view is
    // active, and the reservation is back to its initial size.
    assert_eq!(driver.shadow_of(view, TEXT_GFN), None);
    assert_eq!(
        driver.access_of(view, TEXT_GFN),
        Some(slatrace_core::MemoryAccess::RWX)
    );
    assert_eq!(driver.active_view(), View::DEFAULT);
    assert_eq!(tracer.reserved_bytes(), INIT_MEM_SIZE);
    assert_eq!(tracer.instrumented_pages(), 0);
}

#[test]
fn quit_sets_the_termination_flag() {
    let tracer = tracer();
    let flag = tracer.interrupt_flag();

    tracer.quit().unwrap();

    assert!(flag.load(std::sync::atomic::Ordering::Relaxed));
}

#[test]
fn close_releases_hypervisor_resources() {
    let tracer = tracer();

    tracer.attach("sym_a", RecordingHandler::new(1)).unwrap();
    tracer.start().unwrap();
    tracer.quit().unwrap();

    // The whole lifecycle completes without a teardown warning.
    tracer.close().unwrap();
}

#[test]
fn restored_bytes_survive_a_second_session() {
    // Install, tear down, then install again: the second session copies
    // the (untouched) original bytes and behaves identically.
    let tracer = tracer();
    tracer.attach("sym_a", RecordingHandler::new(1)).unwrap();
    tracer.start().unwrap();
    tracer.quit().unwrap();

    assert_eq!(tracer.reserved_bytes(), INIT_MEM_SIZE);
}
