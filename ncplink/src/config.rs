//! Driver configuration: compile-time sizing and runtime tuning

use embassy_time::Duration;

/// Largest IPv6 datagram accepted from the upper stack.
pub const PAYLOAD_MTU: usize = 1280;

/// Largest decoded frame, and the size of the framer scratch buffers.
pub const FRAME_BUFFER_SIZE: usize = 1500;

/// Encoded output is drained to the console in chunks of this size.
pub const TX_CHUNK_SIZE: usize = 128;

/// Capacity of the interrupt-to-task receive FIFO.
pub const RX_FIFO_SIZE: usize = 128;

/// Free-slot threshold below which the receive interrupt is masked. The
/// consumer re-arms the interrupt once twice this many slots are free.
pub const RX_FIFO_NEAR_FULL_THRESHOLD: usize = RX_FIFO_SIZE / 10;

/// Depth of the outbound message queue.
pub const MESSAGE_QUEUE_SIZE: usize = 16;

/// Recommended ring storage for the outbound store; the caller passes a
/// buffer of (at least) this many bytes to [`crate::State::new`].
pub const TX_RING_BUFFER_SIZE: usize = 5 * PAYLOAD_MTU;

/// Slots available for content handed from the decode path to deferred
/// post-processing (scan results, legacy ULA prefixes).
pub const NUM_CALLBACK_BUFFERS: usize = 4;

/// Depth of the driver-task event mailbox.
pub const EVENT_QUEUE_DEPTH: usize = 8;

/// Size of a vendor legacy ULA prefix.
pub const LEGACY_ULA_SIZE: usize = 8;

/// Bound on version strings read from the NCP or a firmware image.
pub const VERSION_STRING_SIZE: usize = 96;

/// Runtime tuning knobs. [`Config::default`] carries the operational
/// values; tests shorten the deadlines.
#[derive(Debug, Copy, Clone)]
pub struct Config {
    /// Operational console baud rate.
    pub baud: u32,
    /// Deadline for a matching response to an issued request.
    pub response_timeout: Duration,
    /// Deadline for the console to accept one outbound byte.
    pub putchar_timeout: Duration,
    /// How long an outbound submit waits for store space.
    pub store_wait_timeout: Duration,
    /// Hard-reset attempts before initialization gives up.
    pub reset_attempts: u8,
    /// Reset line hold time.
    pub reset_hold: Duration,
    /// Boot settle delay after the reset line is released; the bootloader
    /// strap is held through it.
    pub reset_settle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            baud: 115_200,
            response_timeout: Duration::from_secs(3),
            putchar_timeout: Duration::from_secs(3),
            store_wait_timeout: Duration::from_secs(2),
            reset_attempts: 3,
            reset_hold: Duration::from_millis(3),
            reset_settle: Duration::from_millis(1000),
        }
    }
}
