//! State shared between the driver task, the upper stack and the ISR
//!
//! [`State`] is allocated by the caller (typically statically) and split
//! into three access roles: the [`crate::Driver`] on the driver task, a
//! [`Sender`] per upper-stack producer, and the [`RxIsr`] handle invoked
//! from the receive interrupt. The interrupt side touches nothing but the
//! SPSC FIFO and atomic flags.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, Ordering};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::with_timeout;
use ncplink_core::{DeviceRole, Error, SecurityFlags};
use ncplink_driver::console::Console;

use crate::config::{
    Config, EVENT_QUEUE_DEPTH, PAYLOAD_MTU, RX_FIFO_NEAR_FULL_THRESHOLD, RX_FIFO_SIZE,
};
use crate::fifo::Fifo;
use crate::net;
use crate::store::{Msg, TxStore};

/// Events delivered to the driver-task mailbox.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Received bytes are waiting in the FIFO.
    RxReady,
    /// Outbound datagrams are waiting in the store.
    TxPending,
    /// The pending change-flag set went from zero to non-zero.
    StateChanged,
    /// A legacy ULA prefix was copied into a callback-buffer slot.
    LegacyUla,
    /// A scan result was copied into a callback-buffer slot.
    ScanResult,
    /// The NCP reported the scan finished.
    ScanComplete,
    /// A vendor network-wake notification.
    #[cfg(feature = "legacy-alarm")]
    LegacyWake {
        event: u8,
        time_remaining: u16,
        reason: u8,
    },
    /// The supervisor entered reset recovery.
    Recovery,
}

type RawMutex = CriticalSectionRawMutex;

/// Everything shared across the three execution contexts.
pub struct State<'b> {
    pub(crate) fifo: Fifo<RX_FIFO_SIZE>,
    pub(crate) store: Mutex<RawMutex, RefCell<TxStore<'b>>>,
    pub(crate) events: Channel<RawMutex, Event, EVENT_QUEUE_DEPTH>,
    /// Private mailbox used only while a request awaits its response.
    pub(crate) response_signal: Channel<RawMutex, (), 1>,
    /// Wake mailbox for submitters blocked on store space.
    pub(crate) free_waiter: Channel<RawMutex, (), 1>,

    pub(crate) rx_event_posted: AtomicBool,
    pub(crate) response_event_posted: AtomicBool,
    pub(crate) pump_event_posted: AtomicBool,
    /// True while the driver task is blocked awaiting a response; routes
    /// receive wakes to the private mailbox.
    pub(crate) awaiting_response: AtomicBool,
    pub(crate) rx_isr_masked: AtomicBool,
    pub(crate) decode_failure: AtomicBool,
    pub(crate) stall: AtomicBool,

    /// Written only on the driver task.
    pub(crate) security: AtomicU8,
    /// Written only on the driver task.
    pub(crate) role: AtomicU8,
    pub(crate) insecure_src_port: AtomicU16,
}

impl<'b> State<'b> {
    /// Creates the shared state over caller-provided ring storage for the
    /// outbound store (see [`crate::config::TX_RING_BUFFER_SIZE`]).
    pub fn new(tx_ring: &'b mut [u8]) -> Self {
        Self {
            fifo: Fifo::new(),
            store: Mutex::new(RefCell::new(TxStore::new(tx_ring))),
            events: Channel::new(),
            response_signal: Channel::new(),
            free_waiter: Channel::new(),
            rx_event_posted: AtomicBool::new(false),
            response_event_posted: AtomicBool::new(false),
            pump_event_posted: AtomicBool::new(false),
            awaiting_response: AtomicBool::new(false),
            rx_isr_masked: AtomicBool::new(false),
            decode_failure: AtomicBool::new(false),
            stall: AtomicBool::new(false),
            security: AtomicU8::new(0),
            role: AtomicU8::new(DeviceRole::Disabled as u8),
            insecure_src_port: AtomicU16::new(0),
        }
    }

    /// The upper-stack handle for submitting outbound datagrams.
    pub fn sender<'a>(&'a self, config: Config) -> Sender<'a, 'b> {
        Sender {
            state: self,
            config,
        }
    }

    /// The handle the platform's receive interrupt feeds bytes into.
    pub fn rx_isr<'a, C: Console>(&'a self, console: &'a C) -> RxIsr<'a, 'b, C> {
        RxIsr {
            state: self,
            console,
        }
    }

    pub(crate) fn security(&self) -> SecurityFlags {
        SecurityFlags::from_bits(self.security.load(Ordering::Relaxed))
    }

    /// Driver task only.
    pub(crate) fn update_security(&self, update: impl FnOnce(&mut SecurityFlags)) {
        let mut flags = self.security();
        update(&mut flags);
        self.security.store(flags.into_bits(), Ordering::Relaxed);
    }

    pub(crate) fn role(&self) -> DeviceRole {
        match self.role.load(Ordering::Relaxed) {
            1 => DeviceRole::Detached,
            2 => DeviceRole::Child,
            3 => DeviceRole::Router,
            4 => DeviceRole::Leader,
            _ => DeviceRole::Disabled,
        }
    }

    /// Driver task only.
    pub(crate) fn set_role(&self, role: DeviceRole) {
        self.role.store(role as u8, Ordering::Relaxed);
    }

    pub(crate) fn post(&self, event: Event) {
        if self.events.try_send(event).is_err() {
            error!("event queue overflow");
        }
    }

    /// Posts a receive wake to the task mailbox, at most one resident.
    pub(crate) fn post_rx_ready(&self) {
        if !self.rx_event_posted.fetch_or(true, Ordering::SeqCst) {
            self.post(Event::RxReady);
        }
    }

    /// Posts a receive wake to the private response mailbox, at most one
    /// resident.
    pub(crate) fn post_response_signal(&self) {
        if !self.response_event_posted.fetch_or(true, Ordering::SeqCst) {
            let _ = self.response_signal.try_send(());
        }
    }

    /// Posts a pump event, at most one resident in the task mailbox.
    pub(crate) fn post_pump(&self) {
        if !self.pump_event_posted.fetch_or(true, Ordering::SeqCst) {
            self.post(Event::TxPending);
        }
    }

    /// Releases a message and delivers the waiter wake when owed.
    pub(crate) fn free_msg(&self, msg: &Msg) {
        let wake = self.store.lock(|store| store.borrow_mut().free(msg));
        if wake == Ok(true) {
            let _ = self.free_waiter.try_send(());
        }
    }

    pub(crate) fn queue_is_empty(&self) -> bool {
        self.store.lock(|store| store.borrow().queue_is_empty())
    }
}

/// Receive-interrupt handle: feeds bytes, wakes the task, and gates the
/// interrupt when the FIFO nears capacity.
pub struct RxIsr<'a, 'b, C: Console> {
    state: &'a State<'b>,
    console: &'a C,
}

impl<'a, 'b, C: Console> RxIsr<'a, 'b, C> {
    /// Called from the receive interrupt with each received byte.
    pub fn on_byte(&self, byte: u8) {
        let state = self.state;

        if state.decode_failure.load(Ordering::Relaxed) {
            return;
        }

        if state.awaiting_response.load(Ordering::Relaxed) {
            state.post_response_signal();
        } else {
            state.post_rx_ready();
        }

        // Enqueue even if no event was posted; the task drains the FIFO
        // directly while it waits for a response.
        let _ = state.fifo.put(byte);

        if state.fifo.near_full(RX_FIFO_NEAR_FULL_THRESHOLD)
            && !state.rx_isr_masked.swap(true, Ordering::Relaxed)
        {
            self.console.set_rx_irq_enabled(false);
        }
    }
}

/// Upper-stack handle: submits outbound datagrams into the store and
/// posts the (deduplicated) pump event.
pub struct Sender<'a, 'b> {
    state: &'a State<'b>,
    config: Config,
}

impl<'a, 'b> Sender<'a, 'b> {
    /// Submits one outbound IPv6 datagram.
    ///
    /// Blocks up to the store-wait deadline when the outbound store is
    /// full. When link security is required but the radio is detached the
    /// datagram is dropped and `Ok(())` is returned; the NCP would reject
    /// it anyway and the upper stack retransmits once attached.
    pub async fn send_datagram(&self, datagram: &[u8]) -> Result<(), Error> {
        self.submit(datagram, false).await
    }

    /// Submits one outbound datagram onto the vendor legacy channel.
    #[cfg(feature = "legacy-alarm")]
    pub async fn send_legacy_datagram(&self, datagram: &[u8]) -> Result<(), Error> {
        self.submit(datagram, true).await
    }

    async fn submit(&self, datagram: &[u8], legacy: bool) -> Result<(), Error> {
        if datagram.len() > PAYLOAD_MTU {
            return Err(Error::InvalidArgs);
        }

        let security = self.state.security();
        let secure = security.message_security();

        if !legacy && secure && !self.state.role().is_attached() {
            debug!("detached while security is on, dropping outgoing packet");
            return Ok(());
        }

        let mut msg = self.alloc_with_wait(secure, datagram.len()).await?;

        let appended = self
            .state
            .store
            .lock(|store| store.borrow_mut().append(&mut msg, datagram));
        if let Err(err) = appended {
            self.state.free_msg(&msg);
            return Err(err);
        }

        if legacy {
            msg.set_legacy(true);
        }

        // A device assisting a provisional join answers on the insecure
        // port without link security until a secure message is seen there.
        if !legacy && security.assisting_provisional_join() {
            let port = self.state.insecure_src_port.load(Ordering::Relaxed);
            if net::tcp_src_port(datagram) == Some(port) {
                msg.set_secure(false);
            }
        }

        let queued = self.state.store.lock(|store| store.borrow_mut().enqueue(msg));
        if let Err(err) = queued {
            error!("message queue full, dropping outgoing packet");
            self.state.free_msg(&msg);
            return Err(err);
        }

        self.state.post_pump();
        Ok(())
    }

    async fn alloc_with_wait(&self, secure: bool, len: usize) -> Result<Msg, Error> {
        loop {
            let allocated = self
                .state
                .store
                .lock(|store| store.borrow_mut().alloc(secure, len));
            if let Some(msg) = allocated {
                return Ok(msg);
            }

            match with_timeout(self.config.store_wait_timeout, self.state.free_waiter.receive())
                .await
            {
                Ok(()) => self
                    .state
                    .store
                    .lock(|store| store.borrow_mut().set_waiter_idle()),
                Err(_) => {
                    error!("wait for free message timed out");
                    return Err(Error::NoBufs);
                }
            }
        }
    }
}
