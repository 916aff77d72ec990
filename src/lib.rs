//! RISC-V Platform-Level Interrupt Controller driver.
//!
//! The PLIC funnels every external interrupt line of a machine into one
//! claim/complete register per hart. This crate owns the register
//! protocol: per-hart address computation, enable-bit masking, priority
//! and threshold configuration, and the claim → handler → complete cycle
//! over a flat table of interrupt service routines.
//!
//! Bring-up order: call [`init`] once with the board's base address and
//! [`PlicParams`], register routines with [`set_handler`], give the
//! wanted sources a nonzero priority and [`enable`] them, then point the
//! external-interrupt arm of the trap handler at
//! [`handle_external_interrupt`].
//!
//! Everything here also exists as methods on [`Plic`] for platforms that
//! can thread a context value through their trap path; the free
//! functions exist because the lowest-level trap entry usually cannot.

#![cfg_attr(not(test), no_std)]

mod consts;
mod platform;
mod plic;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod utils;

pub use consts::*;
pub use platform::{MmioPlatform, Platform};
pub use plic::{IsrHandler, Plic, PlicParams};

use spin::Once;

static PLIC: Once<Plic<MmioPlatform>> = Once::new();

/// Quiesces the controller and installs the process-wide instance the
/// free functions below operate on.
///
/// Running it again re-quiesces the registers (the parameters of the
/// first call stay in effect). Any claim outstanding on this hart is
/// dropped, so never re-run it while interrupts are live.
///
/// # Safety
///
/// `base` must be the mapped address of the controller register block.
pub unsafe fn init(base: usize, params: PlicParams) {
    let plic = PLIC.call_once(|| Plic::new(unsafe { MmioPlatform::new(base) }, params));
    plic.init();
}

fn plic() -> &'static Plic<MmioPlatform> {
    PLIC.get().expect("plic: used before init()")
}

/// Lets `irq` take part in claim arbitration on the calling hart.
pub fn enable(irq: u32) {
    plic().enable(irq);
}

/// Removes `irq` from claim arbitration on the calling hart.
pub fn disable(irq: u32) {
    plic().disable(irq);
}

/// Sets the arbitration priority of `irq`; 0 parks the source.
pub fn set_priority(irq: u32, value: u32) {
    plic().set_priority(irq, value);
}

/// Sets the calling hart's priority floor.
pub fn set_threshold(value: u32) {
    plic().set_threshold(value);
}

/// Installs the service routine for `irq`; last registration wins.
pub fn set_handler(irq: u32, handler: IsrHandler) {
    plic().set_handler(irq, handler);
}

/// Whether `irq` is latched pending in the controller.
pub fn is_pending(irq: u32) -> bool {
    plic().is_pending(irq)
}

/// External-interrupt entry for the trap layer: claim, dispatch,
/// complete on the calling hart.
pub fn handle_external_interrupt() {
    plic().handle_interrupt();
}
