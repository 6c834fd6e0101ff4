//! The driver-task handle: session supervisor, outbound pump, and the
//! typed request surface
//!
//! All methods here run on the single driver task. Requests are issued
//! and awaited one at a time, so a response can always be correlated to
//! the one pending transaction; unsolicited frames that interleave with
//! it are routed through the control-plane dispatch.

use core::sync::atomic::Ordering;

use embassy_time::{Duration, Instant, Timer, with_timeout};
use heapless::{String, Vec};
use ncplink_core::{
    ChangeFlags, Command, DeviceRole, Error, Header, HostPowerState, PropKey, SecurityFlags,
    Status, Tid,
};
use ncplink_driver::console::{Console, ConsoleConfig};
use ncplink_driver::reset::ResetControl;

use crate::codec::{Packer, Unpacker};
use crate::config::{
    Config, RX_FIFO_NEAR_FULL_THRESHOLD, TX_CHUNK_SIZE, VERSION_STRING_SIZE,
};
use crate::dispatch::{self, DatagramMeta, DispatchState, ScanResult, Slot};
use crate::hdlc::{self, Chunk};
use crate::state::{Event, State};
use crate::store::Msg;
use crate::transport::Transport;
use crate::{config, net};

#[cfg(feature = "legacy-alarm")]
use crate::config::LEGACY_ULA_SIZE;

/// NCP power-state value announcing the host is going away for good.
const POWER_STATE_OFFLINE: u8 = 0;

/// Scan-state value that starts an active beacon scan.
const SCAN_STATE_BEACON: u8 = 1;

const SCAN_CHANNEL_MIN: u8 = 11;
const SCAN_CHANNEL_MAX: u8 = 26;

/// The capability set the driver reports into. Implement the optional
/// methods only for the notifications the product consumes.
pub trait Client {
    /// One inbound datagram; the payload borrow ends with the call.
    fn on_datagram(&mut self, datagram: &[u8], meta: DatagramMeta);

    /// The aggregated pending change set, consumed atomically.
    fn on_state_changed(&mut self, flags: ChangeFlags);

    /// The supervisor entered reset recovery; the client is expected to
    /// drive reinitialization and rehydrate NCP state.
    fn on_reset_recovery(&mut self) {}

    /// One scan result, or `None` when the scan completed.
    fn on_scan_result(&mut self, result: Option<&ScanResult>) {
        let _ = result;
    }

    /// The vendor legacy ULA prefix changed.
    fn on_legacy_ula(&mut self, prefix: &[u8; config::LEGACY_ULA_SIZE]) {
        let _ = prefix;
    }

    /// A vendor network-wake notification.
    #[cfg(feature = "legacy-alarm")]
    fn on_legacy_wake(&mut self, event: u8, time_remaining: u16, reason: u8) {
        let _ = (event, time_remaining, reason);
    }
}

/// Session lifecycle states of the supervisor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    Uninitialized,
    Initialized,
    ResetRecovery,
    HostSleep,
}

/// How [`Driver::initialize`] brings the link up.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitMode {
    /// Always hard-reset the NCP and verify the reset announcement.
    Reset,
    /// Try to re-establish communication with the running NCP first (the
    /// host woke rather than cold-booted); falls back to a reset.
    Reestablish,
}

/// A unicast address entry from the NCP's address table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NetifAddress {
    pub address: [u8; 16],
    pub prefix_len: u8,
    pub preferred: bool,
    pub valid: bool,
}

/// Thread link mode bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkMode {
    pub rx_on_when_idle: bool,
    pub secure_data_requests: bool,
    pub full_function: bool,
    pub full_network_data: bool,
}

impl LinkMode {
    const FULL_NETWORK_DATA: u8 = 0x01;
    const FULL_FUNCTION: u8 = 0x02;
    const SECURE_DATA_REQUESTS: u8 = 0x04;
    const RX_ON_WHEN_IDLE: u8 = 0x08;

    pub const fn to_wire(self) -> u8 {
        (self.rx_on_when_idle as u8 * Self::RX_ON_WHEN_IDLE)
            | (self.secure_data_requests as u8 * Self::SECURE_DATA_REQUESTS)
            | (self.full_function as u8 * Self::FULL_FUNCTION)
            | (self.full_network_data as u8 * Self::FULL_NETWORK_DATA)
    }

    pub const fn from_wire(bits: u8) -> Self {
        Self {
            rx_on_when_idle: bits & Self::RX_ON_WHEN_IDLE != 0,
            secure_data_requests: bits & Self::SECURE_DATA_REQUESTS != 0,
            full_function: bits & Self::FULL_FUNCTION != 0,
            full_network_data: bits & Self::FULL_NETWORK_DATA != 0,
        }
    }
}

/// On-mesh prefix configuration for the border-router surface.
#[cfg(feature = "border-router")]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BorderRouterConfig {
    pub prefix: [u8; 16],
    pub prefix_len: u8,
    pub preference: u8,
    pub preferred: bool,
    pub slaac: bool,
    pub dhcp: bool,
    pub configure: bool,
    pub default_route: bool,
    pub on_mesh: bool,
    pub stable: bool,
}

/// Off-mesh route configuration for the border-router surface.
#[cfg(feature = "border-router")]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExternalRouteConfig {
    pub prefix: [u8; 16],
    pub prefix_len: u8,
    pub preference: u8,
    pub stable: bool,
}

/// A child-table entry.
#[cfg(feature = "ftd")]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChildInfo {
    pub ext_address: [u8; 8],
    pub rloc16: u16,
    pub timeout: u32,
    pub age: u32,
    pub network_data_version: u8,
    pub link_quality_in: u8,
    pub average_rssi: i8,
    pub mode: LinkMode,
    pub last_rssi: i8,
}

/// A neighbor-table entry.
#[cfg(feature = "ftd")]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NeighborInfo {
    pub ext_address: [u8; 8],
    pub rloc16: u16,
    pub age: u32,
    pub link_quality_in: u8,
    pub average_rssi: i8,
    pub mode: LinkMode,
    pub is_child: bool,
    pub link_frame_counter: u32,
    pub mle_frame_counter: u32,
    pub last_rssi: i8,
}

pub struct Driver<'d, 'b, C: Console, R: ResetControl, CL: Client> {
    pub(crate) state: &'d State<'b>,
    pub(crate) console: &'d C,
    pub(crate) reset: &'d R,
    pub(crate) client: CL,
    pub(crate) config: Config,
    pub(crate) transport: Transport,
    pub(crate) dispatch: DispatchState,
    pub(crate) session: SessionState,
}

impl<'d, 'b, C: Console, R: ResetControl, CL: Client> Driver<'d, 'b, C, R, CL> {
    pub fn new(
        state: &'d State<'b>,
        console: &'d C,
        reset: &'d R,
        client: CL,
        config: Config,
    ) -> Self {
        Self {
            state,
            console,
            reset,
            client,
            config,
            transport: Transport::new(),
            dispatch: DispatchState::new(),
            session: SessionState::Uninitialized,
        }
    }

    pub fn session(&self) -> SessionState {
        self.session
    }

    /// The cached device role; updated by unsolicited role changes.
    pub fn device_role(&self) -> DeviceRole {
        self.state.role()
    }

    /// Status code from the most recent last-status report.
    pub fn last_status(&self) -> Status {
        self.dispatch.last_status
    }

    fn check_initialized(&self) -> Result<(), Error> {
        if self.session == SessionState::Initialized {
            Ok(())
        } else {
            Err(Error::InvalidState)
        }
    }

    // --- event loop ---------------------------------------------------

    /// Runs the driver task forever.
    pub async fn run(&mut self) -> ! {
        loop {
            let event = self.state.events.receive().await;
            self.process(event).await;
        }
    }

    /// Handles every event currently in the mailbox, then returns.
    pub async fn process_pending(&mut self) {
        while let Ok(event) = self.state.events.try_receive() {
            self.process(event).await;
        }
    }

    /// Handles one event.
    pub async fn process(&mut self, event: Event) {
        match event {
            Event::RxReady => {
                self.state.rx_event_posted.store(false, Ordering::SeqCst);
                self.process_fifo();

                if !self.state.decode_failure.load(Ordering::Relaxed)
                    && !self.state.fifo.is_empty()
                {
                    // Come back later to finish draining.
                    self.state.post_rx_ready();
                }
            }

            Event::TxPending => self.drain_outbound().await,

            Event::StateChanged => {
                let flags = self.dispatch.pending_flags.take();
                self.client.on_state_changed(flags);
            }

            Event::LegacyUla => {
                for slot in &mut self.dispatch.slots {
                    if let Slot::LegacyUla(prefix) = slot {
                        self.client.on_legacy_ula(prefix);
                        *slot = Slot::Free;
                    }
                }
            }

            Event::ScanResult => {
                for slot in &mut self.dispatch.slots {
                    if let Slot::ScanResult(result) = slot {
                        self.client.on_scan_result(Some(result));
                        *slot = Slot::Free;
                    }
                }
            }

            Event::ScanComplete => self.client.on_scan_result(None),

            #[cfg(feature = "legacy-alarm")]
            Event::LegacyWake {
                event,
                time_remaining,
                reason,
            } => self.client.on_legacy_wake(event, time_remaining, reason),

            Event::Recovery => self.client.on_reset_recovery(),
        }
    }

    // --- receive path -------------------------------------------------

    /// Drains the receive FIFO through the framer. Stops early once the
    /// awaited response is captured: reading further would overwrite the
    /// response arguments in the framer scratch.
    fn process_fifo(&mut self) {
        while !self.state.decode_failure.load(Ordering::Relaxed)
            && !self.transport.response_received()
        {
            let Some(byte) = self.state.fifo.get() else {
                break;
            };

            match self.transport.decoder.push(byte) {
                Ok(Some(len)) => self.handle_frame(len),
                Ok(None) => {}
                Err(err) => {
                    error!("frame decode failed: {:?}", err);
                    self.state.decode_failure.store(true, Ordering::Relaxed);
                    if let Some(pending) = self.transport.pending.as_mut() {
                        pending.received = true;
                        pending.success = false;
                    }
                    self.initiate_recovery();
                }
            }

            if self.state.rx_isr_masked.load(Ordering::Relaxed)
                && !self.state.fifo.near_full(2 * RX_FIFO_NEAR_FULL_THRESHOLD)
            {
                self.state.rx_isr_masked.store(false, Ordering::Relaxed);
                self.console.set_rx_irq_enabled(true);
            }
        }
    }

    fn handle_frame(&mut self, len: usize) {
        let (header, command, key, args_start) = {
            let mut unpacker = Unpacker::new(self.transport.decoder.frame(len));
            let parsed = (|| {
                let header = Header::from_u8(unpacker.get_u8()?);
                let command = Command::new(unpacker.get_uint_packed()?);
                let key = PropKey::new(unpacker.get_uint_packed()?);
                Ok::<_, Error>((header, command, key))
            })();

            match parsed {
                Ok((header, command, key)) => (header, command, key, len - unpacker.remaining()),
                Err(_) => {
                    error!("failed to parse incoming frame");
                    return;
                }
            }
        };

        if self.state.awaiting_response.load(Ordering::Relaxed)
            && self.transport.match_response(header, command, key)
        {
            let run_last_status = {
                let pending = unwrap!(self.transport.pending.as_mut());
                pending.received = true;
                pending.args = (args_start, len);
                !pending.success && key == PropKey::LAST_STATUS
            };

            // A last-status answering a failed request carries the NCP's
            // error code; record it (and recover on a reset code).
            if run_last_status
                && dispatch::handle_last_status(
                    &mut self.dispatch,
                    &self.transport.decoder.frame(len)[args_start..],
                )
            {
                self.initiate_recovery();
            }
        } else if key.is_datagram_stream() {
            dispatch::receive_datagram(
                self.state,
                &mut self.client,
                command,
                key,
                &self.transport.decoder.frame(len)[args_start..],
            );
        } else if dispatch::receive_control(
            &mut self.dispatch,
            self.state,
            command,
            key,
            &self.transport.decoder.frame(len)[args_start..],
        ) {
            self.initiate_recovery();
        }
    }

    // --- transmit path ------------------------------------------------

    /// Packs and sends one frame: header, command, key, then whatever the
    /// builder appends.
    pub(crate) fn send_frame(
        &mut self,
        tid: Tid,
        command: Command,
        key: PropKey,
        build: impl FnOnce(&mut Packer<'_>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let len = {
            let mut packer = Packer::new(&mut self.transport.tx_frame);
            let packed = (|| {
                packer.put_u8(Header::new(tid).into_u8())?;
                packer.put_uint_packed(command.into_u32())?;
                packer.put_uint_packed(key.into_u32())?;
                build(&mut packer)
            })();

            if packed.is_err() {
                error!("failed to pack outgoing frame");
                return Err(Error::Parse);
            }
            packer.len()
        };

        self.uart_send_frame(len)
    }

    /// Encodes `len` bytes of the frame scratch through the framer,
    /// draining the chunk to the console whenever it fills.
    fn uart_send_frame(&mut self, len: usize) -> Result<(), Error> {
        let mut storage = [0u8; TX_CHUNK_SIZE];
        let mut chunk = Chunk::new(&mut storage);
        let mut encoder = hdlc::Encoder::new();

        if encoder.start(&mut chunk).is_err() {
            return Err(Error::NoBufs);
        }

        let mut pos = 0;
        while pos < len {
            match encoder.encode(self.transport.tx_frame[pos], &mut chunk) {
                Ok(()) => pos += 1,
                Err(hdlc::BufferExhausted) => {
                    self.put_chars(chunk.as_slice())?;
                    chunk.clear();
                }
            }
        }

        loop {
            match encoder.finalize(&mut chunk) {
                Ok(()) => break,
                Err(hdlc::BufferExhausted) => {
                    self.put_chars(chunk.as_slice())?;
                    chunk.clear();
                }
            }
        }

        self.put_chars(chunk.as_slice())
    }

    /// Pushes bytes to the console, polling readiness up to the deadline.
    /// While the console is refusing bytes and our receive interrupt is
    /// masked, the NCP may itself be blocked sending to us; draining our
    /// FIFO breaks that mutual stall.
    fn put_chars(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let mut stamp = Instant::now();

        for &byte in bytes {
            loop {
                if Instant::now() - stamp >= self.config.putchar_timeout {
                    error!("console send timed out");
                    return Err(Error::Busy);
                }

                if self.console.can_put() {
                    self.console.put(byte);
                    stamp = Instant::now();
                    break;
                }

                if self.state.rx_isr_masked.load(Ordering::Relaxed) {
                    self.process_fifo();
                }
            }
        }
        Ok(())
    }

    // --- request/response ---------------------------------------------

    async fn request(
        &mut self,
        command: Command,
        key: PropKey,
        expect_command: Command,
        expect_key: PropKey,
        build: impl FnOnce(&mut Packer<'_>) -> Result<(), Error>,
    ) -> Result<(usize, usize), Error> {
        let tid = self.transport.next_tid();
        self.send_frame(tid, command, key, build)?;
        self.transport.expect(tid, expect_command, expect_key);
        self.wait_for_response(false).await
    }

    /// Waits for the response registered with [`Transport::expect`].
    ///
    /// Timeouts surface as [`Error::NoFrameReceived`] and, outside the
    /// reset handshake, hand the session to recovery: the NCP is presumed
    /// unresponsive.
    async fn wait_for_response(&mut self, ignore_timeout: bool) -> Result<(usize, usize), Error> {
        if self.state.decode_failure.load(Ordering::Relaxed) {
            self.transport.pending = None;
            return Err(Error::NoFrameReceived);
        }

        self.state.awaiting_response.store(true, Ordering::SeqCst);

        let mut result = Err(Error::NoFrameReceived);
        loop {
            self.process_fifo();

            if let Some(pending) = self.transport.pending.as_ref()
                && pending.received
            {
                result = if pending.success {
                    Ok(pending.args)
                } else {
                    Err(Error::Failed)
                };
                break;
            }

            match with_timeout(
                self.config.response_timeout,
                self.state.response_signal.receive(),
            )
            .await
            {
                Ok(()) => self.state.response_event_posted.store(false, Ordering::SeqCst),
                Err(_) => break,
            }
        }

        // A wake may have raced into the private mailbox after the match;
        // move it to the shared mailbox so those bytes are not stranded.
        if self.state.response_signal.try_receive().is_ok() {
            self.state.post_rx_ready();
        }
        self.state.awaiting_response.store(false, Ordering::SeqCst);
        self.state.response_event_posted.store(false, Ordering::SeqCst);

        let timed_out = !self.transport.response_received() && result.is_err();
        self.transport.pending = None;

        if timed_out && matches!(result, Err(Error::NoFrameReceived)) {
            warn!("wait for NCP response timed out");
            if !ignore_timeout {
                self.initiate_recovery();
            }
        }

        result
    }

    pub(crate) fn response_args(&self, range: (usize, usize)) -> &[u8] {
        &self.transport.decoder.frame(range.1)[range.0..]
    }

    async fn get_prop(&mut self, key: PropKey) -> Result<(usize, usize), Error> {
        self.check_initialized()?;
        self.request(
            Command::PROP_VALUE_GET,
            key,
            Command::PROP_VALUE_IS,
            key,
            |_| Ok(()),
        )
        .await
    }

    async fn set_prop(
        &mut self,
        key: PropKey,
        build: impl FnOnce(&mut Packer<'_>) -> Result<(), Error>,
    ) -> Result<(usize, usize), Error> {
        self.check_initialized()?;
        self.request(
            Command::PROP_VALUE_SET,
            key,
            Command::PROP_VALUE_IS,
            key,
            build,
        )
        .await
    }

    /// Sets a bool property and verifies the echoed value.
    async fn set_bool_verified(&mut self, key: PropKey, value: bool) -> Result<(), Error> {
        let range = self.set_prop(key, |p| p.put_bool(value)).await?;
        let echoed = Unpacker::new(self.response_args(range)).get_bool()?;
        if echoed != value {
            return Err(Error::Failed);
        }
        Ok(())
    }

    async fn get_bool(&mut self, key: PropKey) -> Result<bool, Error> {
        let range = self.get_prop(key).await?;
        Unpacker::new(self.response_args(range)).get_bool()
    }

    // --- outbound pump ------------------------------------------------

    /// Drains the outbound queue: one frame per message, each acknowledged
    /// by a last-status response. The message is freed before the wait so
    /// store space comes back early.
    async fn drain_outbound(&mut self) {
        self.state.pump_event_posted.store(false, Ordering::SeqCst);

        if self.session != SessionState::Initialized {
            return;
        }
        // Under stall, return without draining and without reposting.
        if self.state.stall.load(Ordering::Relaxed) {
            return;
        }

        loop {
            let Some(mut msg) = self.state.store.lock(|s| s.borrow_mut().dequeue()) else {
                break;
            };

            if self.state.security().need_insecure_source_port() {
                // This device is joining provisionally: the TCP source
                // port picked by the upper stack must be opened as
                // insecure on the NCP before the first frame goes out.
                self.open_source_port(&mut msg).await;
            }

            let (command, key) = if msg.is_legacy() {
                (Command::VENDOR_PROP_VALUE_SET, PropKey::STREAM_NET)
            } else if msg.is_secure() {
                (Command::PROP_VALUE_SET, PropKey::STREAM_NET)
            } else {
                (Command::PROP_VALUE_SET, PropKey::STREAM_NET_INSECURE)
            };

            let tid = self.transport.next_tid();
            let sent = self.send_datagram_frame(tid, command, key, &msg);
            self.state.free_msg(&msg);

            let acked = match sent {
                Ok(()) => {
                    self.transport
                        .expect(tid, Command::PROP_VALUE_IS, PropKey::LAST_STATUS);
                    match self.wait_for_response(false).await {
                        Ok(range) => Unpacker::new(self.response_args(range))
                            .get_uint_packed()
                            .map(Status::new),
                        Err(err) => Err(err),
                    }
                }
                Err(err) => Err(err),
            };

            match acked {
                Ok(status) if status.is_ok() => {}
                Ok(status) => {
                    warn!(
                        "IP packet rejected by NCP: {} {}",
                        status.into_u32(),
                        key.into_u32()
                    );
                }
                Err(_) => {
                    error!("outbound drain stopped");
                    break;
                }
            }
        }

        if !self.state.queue_is_empty() {
            // Exited with work left (stall raced in or a send failed);
            // repost so the producer-consumer flow does not stall.
            self.state.post_pump();
        }
    }

    fn send_datagram_frame(
        &mut self,
        tid: Tid,
        command: Command,
        key: PropKey,
        msg: &Msg,
    ) -> Result<(), Error> {
        let state = self.state;
        self.send_frame(tid, command, key, |p| {
            state.store.lock(|s| p.put_data(s.borrow().payload(msg)))
        })
    }

    /// Reads the TCP source port out of the queued datagram and opens it
    /// as insecure on the NCP.
    async fn open_source_port(&mut self, msg: &mut Msg) {
        let mut header = [0u8; net::IP6_HEADER_LEN + 2];
        let n = self
            .state
            .store
            .lock(|s| s.borrow().read(msg, &mut header));
        msg.reset_pos();

        let result = async {
            if n < header.len() {
                return Err(Error::Parse);
            }
            if net::next_header(&header) != Some(net::NEXT_HEADER_TCP) {
                return Err(Error::InvalidArgs);
            }

            let port = u16::from_be_bytes([
                header[net::IP6_HEADER_LEN],
                header[net::IP6_HEADER_LEN + 1],
            ]);
            debug!("open port {}", port);

            self.add_unsecure_port(port).await?;
            self.state
                .update_security(|f| f.insert(SecurityFlags::INSECURE_SOURCE_PORT));
            Ok(())
        }
        .await;

        if let Err(err) = result {
            error!("open source port failed: {:?}", err);
        }
    }

    // --- supervisor ---------------------------------------------------

    /// Brings the session up. With [`InitMode::Reestablish`] a running NCP
    /// is probed first; otherwise (or when probing fails) the NCP is
    /// hard-reset up to the configured number of attempts and the reset
    /// announcement is verified.
    pub async fn initialize(&mut self, mode: InitMode) -> Result<(), Error> {
        self.dispatch.reset();
        self.session = SessionState::Initialized;

        let mut result = Err(Error::Failed);
        if mode == InitMode::Reestablish {
            result = self.reestablish().await;
        }
        if result.is_err() {
            result = self.reset_ncp_with_verify().await;
        }
        if result.is_err() {
            self.session = SessionState::Uninitialized;
        }
        result
    }

    /// Tears the session down: announces offline (best effort) and
    /// disables the console so a later initialize can recover the link.
    pub async fn finalize(&mut self) -> Result<(), Error> {
        let tid = self.transport.next_tid();
        if self
            .send_frame(tid, Command::PROP_VALUE_SET, PropKey::POWER_STATE, |p| {
                p.put_u8(POWER_STATE_OFFLINE)
            })
            .is_ok()
        {
            self.transport
                .expect(tid, Command::PROP_VALUE_IS, PropKey::LAST_STATUS);
            let _ = self.wait_for_response(false).await;
        }

        self.uart_disable();
        self.session = SessionState::Uninitialized;
        Ok(())
    }

    async fn reestablish(&mut self) -> Result<(), Error> {
        self.uart_disable();
        self.uart_enable();

        // Probing net-role doubles as the liveness check; other frames may
        // arrive first and flow through dispatch as usual.
        let range = self.get_prop(PropKey::NET_ROLE).await?;
        let wire = Unpacker::new(self.response_args(range)).get_u8()?;
        self.state.set_role(DeviceRole::from_wire(wire));

        info!("re-established NCP comm without reset");
        Ok(())
    }

    async fn reset_ncp_with_verify(&mut self) -> Result<(), Error> {
        let mut result = Err(Error::NoFrameReceived);

        // One attempt normally suffices; some boards need a second pulse
        // right after power-on.
        for _ in 0..self.config.reset_attempts {
            self.uart_disable();
            self.hard_reset(false).await;
            self.uart_enable();

            self.transport.expect(
                Tid::DONT_CARE,
                Command::PROP_VALUE_IS,
                PropKey::LAST_STATUS,
            );
            result = self.wait_for_response(true).await;
            if result.is_ok() {
                break;
            }
        }

        let range = result?;
        let code = Unpacker::new(self.response_args(range))
            .get_uint_packed()
            .map_err(|_| Error::Parse)?;
        if !Status::new(code).is_reset() {
            return Err(Error::NoAck);
        }
        Ok(())
    }

    /// Pulses the reset line with the bootloader strap held as requested.
    pub(crate) async fn hard_reset(&mut self, bootloader: bool) {
        self.reset.set_bootloader_mode(bootloader);
        Timer::after(Duration::from_millis(1)).await;

        self.reset.set_reset(true);
        Timer::after(self.config.reset_hold).await;
        self.reset.set_reset(false);

        // The ROM samples the strap while booting; hold it through the
        // settle delay.
        Timer::after(self.config.reset_settle).await;
        self.reset.set_bootloader_mode(false);
    }

    pub(crate) fn uart_enable(&mut self) {
        self.state.decode_failure.store(false, Ordering::Relaxed);
        self.state.fifo.reset();
        self.transport.decoder.reset();

        self.console
            .enable(&ConsoleConfig::operational(self.config.baud));
        self.state.rx_isr_masked.store(false, Ordering::Relaxed);
        self.console.set_rx_irq_enabled(true);
    }

    pub(crate) fn uart_disable(&mut self) {
        self.console.set_rx_irq_enabled(false);
        self.console.disable();
        self.state.decode_failure.store(false, Ordering::Relaxed);
        self.state.fifo.reset();
    }

    /// Marks the session unrecoverable and schedules the recovery event.
    /// Idempotent while recovery is already in progress.
    pub fn initiate_recovery(&mut self) {
        if self.session == SessionState::ResetRecovery {
            return;
        }
        self.session = SessionState::ResetRecovery;
        self.state.post(Event::Recovery);
    }

    /// Puts the NCP into host-is-asleep filtering and quiesces the
    /// console. The NCP may send one more frame before settling, so the
    /// power-state exchange repeats until the line is silent.
    pub async fn host_sleep(&mut self) -> Result<(), Error> {
        loop {
            self.set_host_power_state(HostPowerState::LowPower).await?;
            if self.uart_sleep_disable() {
                break;
            }
        }

        self.session = SessionState::HostSleep;
        Ok(())
    }

    /// Re-enables the console after host sleep.
    pub fn host_wake(&mut self) -> Result<(), Error> {
        if self.session != SessionState::HostSleep {
            return Err(Error::InvalidState);
        }

        self.uart_enable();
        self.session = SessionState::Initialized;
        Ok(())
    }

    /// Succeeds only when every received byte has been consumed and no
    /// frame is mid-decode.
    fn uart_sleep_disable(&mut self) -> bool {
        self.state.rx_isr_masked.store(true, Ordering::Relaxed);
        self.console.set_rx_irq_enabled(false);

        if self.state.fifo.is_empty() && self.transport.decoder.in_progress() == 0 {
            self.console.disable();
            true
        } else {
            self.state.rx_isr_masked.store(false, Ordering::Relaxed);
            self.console.set_rx_irq_enabled(true);
            false
        }
    }

    async fn set_host_power_state(&mut self, power: HostPowerState) -> Result<(), Error> {
        let value = u8::from(power);
        let range = self
            .set_prop(PropKey::HOST_POWER_STATE, |p| p.put_u8(value))
            .await?;
        let echoed = Unpacker::new(self.response_args(range)).get_u8()?;
        if echoed != value {
            return Err(Error::Failed);
        }
        Ok(())
    }

    /// Gates the outbound pump. Lifting the stall with work queued posts
    /// exactly one pump event.
    pub fn stall_outgoing(&mut self, enable: bool) {
        let prev = self.state.stall.swap(enable, Ordering::SeqCst);
        if prev != enable && !enable && !self.state.queue_is_empty() {
            self.state.post_pump();
        }
    }

    // --- typed request surface ----------------------------------------

    /// Starts or stops the Thread protocol. While started, outgoing data
    /// packets are link-secured.
    pub async fn thread_start(&mut self, start: bool) -> Result<(), Error> {
        self.set_bool_verified(PropKey::NET_STACK_UP, start).await?;

        self.state.update_security(|flags| {
            if start {
                flags.insert(SecurityFlags::THREAD_STARTED);
            } else {
                flags.remove(SecurityFlags::THREAD_STARTED);
            }
        });
        Ok(())
    }

    /// Brings the network interface up or down.
    pub async fn interface_up(&mut self, up: bool) -> Result<(), Error> {
        self.set_bool_verified(PropKey::NET_IF_UP, up).await
    }

    pub async fn is_interface_enabled(&mut self) -> Result<bool, Error> {
        self.get_bool(PropKey::NET_IF_UP).await
    }

    pub async fn is_node_commissioned(&mut self) -> Result<bool, Error> {
        self.get_bool(PropKey::NET_SAVED).await
    }

    /// Erases the NCP's persistent network information.
    pub async fn erase_persistent_info(&mut self) -> Result<(), Error> {
        self.check_initialized()?;
        let range = self
            .request(
                Command::NET_CLEAR,
                PropKey::LAST_STATUS,
                Command::PROP_VALUE_IS,
                PropKey::LAST_STATUS,
                |_| Ok(()),
            )
            .await?;

        let code = Unpacker::new(self.response_args(range)).get_uint_packed()?;
        if !Status::new(code).is_ok() {
            return Err(Error::Failed);
        }
        Ok(())
    }

    /// The running NCP's version string, truncated to the bounded size.
    pub async fn ncp_version(&mut self) -> Result<String<VERSION_STRING_SIZE>, Error> {
        let range = self.get_prop(PropKey::NCP_VERSION).await?;
        let version = Unpacker::new(self.response_args(range)).get_utf8()?;
        Ok(truncate_to(version))
    }

    pub async fn extended_address(&mut self) -> Result<[u8; 8], Error> {
        let range = self.get_prop(PropKey::MAC_15_4_LADDR).await?;
        Ok(*Unpacker::new(self.response_args(range)).get_eui64()?)
    }

    pub async fn set_channel(&mut self, channel: u8) -> Result<(), Error> {
        self.set_prop(PropKey::PHY_CHAN, |p| p.put_uint_packed(channel as u32))
            .await?;
        Ok(())
    }

    pub async fn set_pan_id(&mut self, pan_id: u16) -> Result<(), Error> {
        self.set_prop(PropKey::MAC_15_4_PANID, |p| p.put_u16(pan_id))
            .await?;
        Ok(())
    }

    pub async fn set_extended_pan_id(&mut self, xpanid: &[u8; 8]) -> Result<(), Error> {
        self.set_prop(PropKey::NET_XPANID, |p| p.put_data_raw(xpanid))
            .await?;
        Ok(())
    }

    pub async fn set_master_key(&mut self, key: &[u8]) -> Result<(), Error> {
        if key.is_empty() || key.len() > 32 {
            return Err(Error::InvalidArgs);
        }
        self.set_prop(PropKey::NET_MASTER_KEY, |p| p.put_data_raw(key))
            .await?;
        Ok(())
    }

    pub async fn set_network_name(&mut self, name: &str) -> Result<(), Error> {
        self.set_prop(PropKey::NET_NETWORK_NAME, |p| p.put_utf8(name))
            .await?;
        Ok(())
    }

    pub async fn set_link_mode(&mut self, mode: LinkMode) -> Result<(), Error> {
        self.set_prop(PropKey::THREAD_MODE, |p| p.put_u8(mode.to_wire()))
            .await?;
        Ok(())
    }

    pub async fn set_max_tx_power(&mut self, power: i8) -> Result<(), Error> {
        self.set_prop(PropKey::PHY_TX_POWER, |p| p.put_i8(power))
            .await?;
        Ok(())
    }

    pub async fn set_icmp_echo_enabled(&mut self, enable: bool) -> Result<(), Error> {
        self.set_bool_verified(PropKey::IPV6_ICMP_PING_OFFLOAD, enable)
            .await
    }

    pub async fn rloc16(&mut self) -> Result<u16, Error> {
        let range = self.get_prop(PropKey::THREAD_RLOC16).await?;
        Unpacker::new(self.response_args(range)).get_u16()
    }

    pub async fn partition_id(&mut self) -> Result<u32, Error> {
        let range = self.get_prop(PropKey::NET_PARTITION_ID).await?;
        Unpacker::new(self.response_args(range)).get_u32()
    }

    pub async fn leader_address(&mut self) -> Result<[u8; 16], Error> {
        let range = self.get_prop(PropKey::THREAD_LEADER_ADDR).await?;
        Ok(*Unpacker::new(self.response_args(range)).get_ipv6()?)
    }

    pub async fn network_data_version(&mut self) -> Result<u8, Error> {
        let range = self.get_prop(PropKey::THREAD_NETWORK_DATA_VERSION).await?;
        Unpacker::new(self.response_args(range)).get_u8()
    }

    pub async fn leader_weight(&mut self) -> Result<u8, Error> {
        let range = self.get_prop(PropKey::THREAD_LEADER_WEIGHT).await?;
        Unpacker::new(self.response_args(range)).get_u8()
    }

    pub async fn instant_rssi(&mut self) -> Result<i8, Error> {
        let range = self.get_prop(PropKey::PHY_RSSI).await?;
        Unpacker::new(self.response_args(range)).get_i8()
    }

    /// Opens `port` on the NCP's assisting (insecure) port list.
    pub async fn add_unsecure_port(&mut self, port: u16) -> Result<(), Error> {
        self.check_initialized()?;
        self.request(
            Command::PROP_VALUE_INSERT,
            PropKey::THREAD_ASSISTING_PORTS,
            Command::PROP_VALUE_INSERTED,
            PropKey::THREAD_ASSISTING_PORTS,
            |p| p.put_u16(port),
        )
        .await?;

        self.state.update_security(|flags| {
            flags.insert(SecurityFlags::INSECURE_PORTS_ENABLED);
            flags.remove(SecurityFlags::SECURE_MSG_ON_INSECURE_PORT);
        });
        self.state.insecure_src_port.store(port, Ordering::Relaxed);
        Ok(())
    }

    /// Closes `port`, and with it any source port the driver opened on
    /// behalf of a provisional join.
    pub async fn remove_unsecure_port(&mut self, port: u16) -> Result<(), Error> {
        self.check_initialized()?;
        self.remove_assisting_port(port).await?;
        self.state
            .update_security(|flags| flags.remove(SecurityFlags::INSECURE_PORTS_ENABLED));

        if self
            .state
            .security()
            .contains(SecurityFlags::INSECURE_SOURCE_PORT)
        {
            let src_port = self.state.insecure_src_port.load(Ordering::Relaxed);
            self.remove_assisting_port(src_port).await?;
            self.state
                .update_security(|flags| flags.remove(SecurityFlags::INSECURE_SOURCE_PORT));
        }
        Ok(())
    }

    async fn remove_assisting_port(&mut self, port: u16) -> Result<(), Error> {
        self.request(
            Command::PROP_VALUE_REMOVE,
            PropKey::THREAD_ASSISTING_PORTS,
            Command::PROP_VALUE_REMOVED,
            PropKey::THREAD_ASSISTING_PORTS,
            |p| p.put_u16(port),
        )
        .await?;
        Ok(())
    }

    /// Starts an active beacon scan over the channels set in the bit mask
    /// (channel 11 = bit 11). Results arrive through
    /// [`Client::on_scan_result`]; `None` marks completion.
    pub async fn active_scan(&mut self, channel_mask: u32, period_ms: u16) -> Result<(), Error> {
        self.check_initialized()?;

        self.set_scan_mask(channel_mask).await?;
        self.set_prop(PropKey::MAC_SCAN_PERIOD, |p| p.put_u16(period_ms))
            .await?;
        self.set_prop(PropKey::MAC_SCAN_STATE, |p| p.put_u8(SCAN_STATE_BEACON))
            .await?;
        Ok(())
    }

    async fn set_scan_mask(&mut self, channel_mask: u32) -> Result<(), Error> {
        let mut channels: Vec<u8, 16> = Vec::new();
        for channel in SCAN_CHANNEL_MIN..=SCAN_CHANNEL_MAX {
            if channel_mask & (1 << channel) != 0 {
                let _ = channels.push(channel);
            }
        }

        self.set_prop(PropKey::MAC_SCAN_MASK, |p| p.put_data_raw(&channels))
            .await?;
        Ok(())
    }

    /// Reads the NCP's unicast address table.
    pub async fn unicast_addresses(&mut self) -> Result<Vec<NetifAddress, 4>, Error> {
        let range = self.get_prop(PropKey::IPV6_ADDRESS_TABLE).await?;
        let mut unpacker = Unpacker::new(self.response_args(range));

        let mut table = Vec::new();
        while !unpacker.is_empty() && !table.is_full() {
            let mut entry = unpacker.get_struct()?;
            let address = *entry.get_ipv6()?;
            let prefix_len = entry.get_u8()?;
            let preferred = entry.get_u32()? != 0;
            let valid = entry.get_u32()? != 0;

            let _ = table.push(NetifAddress {
                address,
                prefix_len,
                preferred,
                valid,
            });
        }
        Ok(table)
    }

    /// Reads the NCP's multicast address table.
    pub async fn multicast_addresses(&mut self) -> Result<Vec<[u8; 16], 2>, Error> {
        let range = self.get_prop(PropKey::IPV6_MULTICAST_ADDRESS_TABLE).await?;
        let mut unpacker = Unpacker::new(self.response_args(range));

        let mut table = Vec::new();
        while !unpacker.is_empty() && !table.is_full() {
            let mut entry = unpacker.get_struct()?;
            let _ = table.push(*entry.get_ipv6()?);
        }
        Ok(table)
    }

    #[cfg(feature = "ftd")]
    pub async fn child_table(&mut self) -> Result<Vec<ChildInfo, 16>, Error> {
        let range = self.get_prop(PropKey::THREAD_CHILD_TABLE).await?;
        let mut unpacker = Unpacker::new(self.response_args(range));

        let mut table = Vec::new();
        while !unpacker.is_empty() && !table.is_full() {
            let mut child = unpacker.get_struct()?;
            let info = ChildInfo {
                ext_address: *child.get_eui64()?,
                rloc16: child.get_u16()?,
                timeout: child.get_u32()?,
                age: child.get_u32()?,
                network_data_version: child.get_u8()?,
                link_quality_in: child.get_u8()?,
                average_rssi: child.get_i8()?,
                mode: LinkMode::from_wire(child.get_u8()?),
                last_rssi: child.get_i8()?,
            };
            let _ = table.push(info);
        }
        Ok(table)
    }

    #[cfg(feature = "ftd")]
    pub async fn neighbor_table(&mut self) -> Result<Vec<NeighborInfo, 16>, Error> {
        let range = self.get_prop(PropKey::THREAD_NEIGHBOR_TABLE).await?;
        let mut unpacker = Unpacker::new(self.response_args(range));

        let mut table = Vec::new();
        while !unpacker.is_empty() && !table.is_full() {
            let mut neighbor = unpacker.get_struct()?;
            let info = NeighborInfo {
                ext_address: *neighbor.get_eui64()?,
                rloc16: neighbor.get_u16()?,
                age: neighbor.get_u32()?,
                link_quality_in: neighbor.get_u8()?,
                average_rssi: neighbor.get_i8()?,
                mode: LinkMode::from_wire(neighbor.get_u8()?),
                is_child: neighbor.get_bool()?,
                link_frame_counter: neighbor.get_u32()?,
                mle_frame_counter: neighbor.get_u32()?,
                last_rssi: neighbor.get_i8()?,
            };
            let _ = table.push(info);
        }
        Ok(table)
    }

    // --- border router -------------------------------------------------

    #[cfg(feature = "border-router")]
    async fn allow_net_data_change(&mut self, unlock: bool) -> Result<(), Error> {
        self.set_bool_verified(PropKey::THREAD_ALLOW_LOCAL_NET_DATA_CHANGE, unlock)
            .await
    }

    /// Registers an on-mesh prefix. The local-network-data unlock is
    /// undone on every path; the first error wins.
    #[cfg(feature = "border-router")]
    pub async fn add_border_router(&mut self, config: &BorderRouterConfig) -> Result<(), Error> {
        const PREFERENCE_OFFSET: u8 = 6;
        const PREFERRED: u8 = 1 << 5;
        const SLAAC: u8 = 1 << 4;
        const DHCP: u8 = 1 << 3;
        const CONFIGURE: u8 = 1 << 2;
        const DEFAULT_ROUTE: u8 = 1 << 1;
        const ON_MESH: u8 = 1 << 0;

        self.check_initialized()?;

        let mut flags = (config.preference << PREFERENCE_OFFSET) & (3 << PREFERENCE_OFFSET);
        flags |= if config.preferred { PREFERRED } else { 0 };
        flags |= if config.slaac { SLAAC } else { 0 };
        flags |= if config.dhcp { DHCP } else { 0 };
        flags |= if config.configure { CONFIGURE } else { 0 };
        flags |= if config.default_route { DEFAULT_ROUTE } else { 0 };
        flags |= if config.on_mesh { ON_MESH } else { 0 };

        self.allow_net_data_change(true).await?;
        let result = self
            .request(
                Command::PROP_VALUE_INSERT,
                PropKey::THREAD_ON_MESH_NETS,
                Command::PROP_VALUE_INSERTED,
                PropKey::THREAD_ON_MESH_NETS,
                |p| {
                    p.put_ipv6(&config.prefix)?;
                    p.put_u8(config.prefix_len)?;
                    p.put_bool(config.stable)?;
                    p.put_u8(flags)
                },
            )
            .await
            .map(|_| ());
        let lock = self.allow_net_data_change(false).await;
        result.and(lock)
    }

    #[cfg(feature = "border-router")]
    pub async fn add_external_route(&mut self, config: &ExternalRouteConfig) -> Result<(), Error> {
        const PREFERENCE_OFFSET: u8 = 6;

        self.check_initialized()?;
        let flags = (config.preference << PREFERENCE_OFFSET) & (3 << PREFERENCE_OFFSET);

        self.allow_net_data_change(true).await?;
        let result = self
            .request(
                Command::PROP_VALUE_INSERT,
                PropKey::THREAD_OFF_MESH_ROUTES,
                Command::PROP_VALUE_INSERTED,
                PropKey::THREAD_OFF_MESH_ROUTES,
                |p| {
                    p.put_ipv6(&config.prefix)?;
                    p.put_u8(config.prefix_len)?;
                    p.put_bool(config.stable)?;
                    p.put_u8(flags)
                },
            )
            .await
            .map(|_| ());
        let lock = self.allow_net_data_change(false).await;
        result.and(lock)
    }

    /// Removes an off-mesh route. A last-status of ok counts as success
    /// even without the removed response: after reset recovery the NCP no
    /// longer knows the route, which is the desired end state.
    #[cfg(feature = "border-router")]
    pub async fn remove_external_route(
        &mut self,
        prefix: &[u8; 16],
        prefix_len: u8,
    ) -> Result<(), Error> {
        self.check_initialized()?;

        self.allow_net_data_change(true).await?;

        // Avoid reading a stale ok below.
        self.dispatch.last_status = Status::FAILURE;

        let mut result = self
            .request(
                Command::PROP_VALUE_REMOVE,
                PropKey::THREAD_OFF_MESH_ROUTES,
                Command::PROP_VALUE_REMOVED,
                PropKey::THREAD_OFF_MESH_ROUTES,
                |p| {
                    p.put_ipv6(prefix)?;
                    p.put_u8(prefix_len)
                },
            )
            .await
            .map(|_| ());
        if self.dispatch.last_status.is_ok() {
            result = Ok(());
        }

        let lock = self.allow_net_data_change(false).await;
        result.and(lock)
    }

    // --- vendor legacy -------------------------------------------------

    #[cfg(feature = "legacy-alarm")]
    pub async fn set_legacy_prefix(&mut self, prefix: &[u8], prefix_bits: u8) -> Result<(), Error> {
        self.check_initialized()?;
        let len = (prefix_bits / 8) as usize;
        if len > prefix.len() || len > LEGACY_ULA_SIZE {
            return Err(Error::InvalidArgs);
        }

        self.request(
            Command::PROP_VALUE_SET,
            PropKey::VENDOR_LEGACY_ULA_PREFIX,
            Command::PROP_VALUE_IS,
            PropKey::VENDOR_LEGACY_ULA_PREFIX,
            |p| p.put_data_raw(&prefix[..len]),
        )
        .await?;
        Ok(())
    }

    /// Arms or disarms the legacy network wake; the enable bit and reason
    /// code ride in one u16.
    #[cfg(feature = "legacy-alarm")]
    pub async fn set_legacy_network_wake(&mut self, enable: bool, reason: u8) -> Result<(), Error> {
        self.check_initialized()?;
        let value: u16 = if enable { (0x80u16 << 8) | reason as u16 } else { 0 };

        let range = self
            .request(
                Command::VENDOR_PROP_VALUE_SET,
                PropKey::VENDOR_NETWORK_WAKE_CTRL,
                Command::PROP_VALUE_IS,
                PropKey::VENDOR_NETWORK_WAKE_CTRL,
                |p| p.put_u16(value),
            )
            .await?;

        let echoed = Unpacker::new(self.response_args(range)).get_u16()?;
        if echoed != value {
            return Err(Error::Failed);
        }
        Ok(())
    }

    #[cfg(feature = "legacy-alarm")]
    pub async fn set_legacy_network_lurk(&mut self, enable: bool) -> Result<(), Error> {
        self.check_initialized()?;
        let range = self
            .request(
                Command::VENDOR_PROP_VALUE_SET,
                PropKey::VENDOR_NETWORK_LURK_CTRL,
                Command::PROP_VALUE_IS,
                PropKey::VENDOR_NETWORK_LURK_CTRL,
                |p| p.put_bool(enable),
            )
            .await?;

        let echoed = Unpacker::new(self.response_args(range)).get_bool()?;
        if echoed != enable {
            return Err(Error::Failed);
        }
        Ok(())
    }

    #[cfg(feature = "credential-recovery")]
    pub async fn recover_legacy_credentials(&mut self) -> Result<Status, Error> {
        self.legacy_credential_op(PropKey::VENDOR_CREDENTIALS_RECOVERY)
            .await
    }

    #[cfg(feature = "credential-recovery")]
    pub async fn erase_legacy_credentials(&mut self) -> Result<Status, Error> {
        self.legacy_credential_op(PropKey::VENDOR_CREDENTIALS_ERASE)
            .await
    }

    #[cfg(feature = "credential-recovery")]
    async fn legacy_credential_op(&mut self, key: PropKey) -> Result<Status, Error> {
        self.check_initialized()?;
        let range = self
            .request(
                Command::VENDOR_PROP_VALUE_SET,
                key,
                Command::PROP_VALUE_IS,
                key,
                |p| p.put_bool(true),
            )
            .await?;

        let code = Unpacker::new(self.response_args(range)).get_uint_packed()?;
        Ok(Status::new(code))
    }
}

/// Byte-truncates to the bounded string size on a character boundary.
fn truncate_to<const N: usize>(value: &str) -> String<N> {
    let mut out = String::new();
    for ch in value.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}
