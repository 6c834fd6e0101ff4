//! NCP link driver interface
//!
//! The crate provides the interface between a serial console driver and the
//! ncplink stack. Limited scope facilitates compatibility across versions.
//! Platform crates should depend on this crate. ncplink stack users should
//! depend on the `ncplink` crate instead.
//!
//! Two seams are defined:
//! * [`console::Console`] is the byte-oriented serial console the NCP is
//!   wired to: polled transmit with readiness, receive-interrupt gating,
//!   and enable/disable with a baud and flow-control configuration.
//! * [`reset::ResetControl`] is the pair of output pins the supervisor
//!   pulses to hard-reset the NCP and to select application-vs-bootloader
//!   boot mode.
//!
//! Received bytes do not flow through this crate; the platform's receive
//! interrupt hands each byte to the stack's ISR handle, which owns the
//! interrupt-to-task FIFO.
#![no_std]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod console;
pub mod reset;

pub mod time {
    pub use embassy_time::{Duration, Instant};
}
