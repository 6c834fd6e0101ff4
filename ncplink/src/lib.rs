//! # ncplink
//!
//! Host-side control and data-plane driver for a Thread/802.15.4 network
//! co-processor (NCP) reached over a byte-oriented serial console. The host
//! runs its own IPv6 stack; this crate is the glue between that upper stack
//! and the NCP's serialized control protocol: an HDLC-style framer, a typed
//! property codec with short transaction identifiers, a bounded outbound
//! message store, and a supervisory state machine for reset recovery, host
//! sleep, and firmware-update handoff.
//!
//! ## Architecture
//!
//! ```text
//!  upper stack task          driver task                receive interrupt
//!  ┌──────────┐        ┌──────────────────┐             ┌────────┐
//!  │  Sender  ├──────► │      Driver      │ ◄───────────┤ RxIsr  │
//!  └────┬─────┘        │  ┌────────────┐  │   byte FIFO └────┬───┘
//!       │              │  │ supervisor │  │                  │
//!       ▼              │  ├────────────┤  │                  ▼
//!  ┌──────────┐        │  │    pump    │  │             ┌────────┐
//!  │ TX store │ ◄────► │  ├────────────┤  │             │ UART   │
//!  └──────────┘        │  │ transport  │ ◄┼───────────► │ (NCP)  │
//!                      │  ├────────────┤  │             └────────┘
//!                      │  │  dispatch  │  │
//!                      │  └─────┬──────┘  │
//!                      └────────┼─────────┘
//!                               ▼
//!                         Client callbacks
//! ```
//!
//! Components:
//! * [`State`] holds everything shared between the three contexts: the
//!   interrupt-to-task byte FIFO, the outbound store and its mutex, the
//!   task mailboxes, and the sticky event flags. The caller allocates it
//!   (typically statically) together with the store's ring storage.
//! * [`Driver`] is the driver-task handle. It owns the framer scratch, the
//!   transaction state and the session state machine, and it is the only
//!   place requests are issued from, so at most one request is pending at
//!   any time.
//! * [`Sender`] is the upper-stack handle: it submits outbound datagrams
//!   into the store and posts a deduplicated pump event.
//! * [`RxIsr`] is the interrupt handle: it feeds received bytes into the
//!   FIFO, wakes the driver task, and masks the receive interrupt when the
//!   FIFO nears capacity.
//! * [`Client`] is the capability set the driver reports into: inbound
//!   datagrams, aggregated state changes, scan results, reset recovery and
//!   the vendor legacy notifications.
//!
//! ## Concurrency model
//!
//! One cooperative driver task plus one interrupt producer. All decoding,
//! dispatch, transaction completion, pump draining and supervisor
//! transitions run on the driver task; the interrupt side only touches the
//! single-producer/single-consumer FIFO and atomic wake flags, never a
//! lock. Dispatch handlers never issue requests themselves; they copy into
//! callback-buffer slots and post events that the driver task replays to
//! the client, so the framer is never entered recursively.
#![no_std]

pub use ncplink_core as core;
pub use ncplink_driver::{console, reset, time};

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod codec;
pub mod config;
mod dispatch;
mod driver;
mod fifo;
pub mod hdlc;
mod net;
mod state;
mod store;
mod transport;
pub mod update;

pub use config::Config;
pub use dispatch::{DatagramMeta, ScanResult};
pub use driver::{Client, Driver, InitMode, LinkMode, NetifAddress, SessionState};
#[cfg(feature = "border-router")]
pub use driver::{BorderRouterConfig, ExternalRouteConfig};
#[cfg(feature = "ftd")]
pub use driver::{ChildInfo, NeighborInfo};
pub use state::{Event, RxIsr, Sender, State};
pub use update::{FirmwareImage, UpdateOutcome};
