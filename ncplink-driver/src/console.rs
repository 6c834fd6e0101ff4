//! Serial console seam between the stack and a platform UART driver

/// Flow-control selection for the console line.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlowControl {
    None,
    Hardware,
}

/// Console line configuration, 8-N-1 at the given baud rate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConsoleConfig {
    pub baud: u32,
    pub flow_control: FlowControl,
}

impl ConsoleConfig {
    /// Operational configuration: hardware flow control on.
    pub const fn operational(baud: u32) -> Self {
        Self {
            baud,
            flow_control: FlowControl::Hardware,
        }
    }

    /// Bootloader configuration: flow control off for the upload handshake.
    pub const fn bootloader(baud: u32) -> Self {
        Self {
            baud,
            flow_control: FlowControl::None,
        }
    }
}

/// A byte-oriented serial console.
///
/// Methods take `&self`; implementations are expected to be register-level
/// or otherwise interior-mutable, because the transmit side is driven from
/// the driver task while receive-interrupt gating is also exercised from
/// the receive interrupt itself.
///
/// The receive path is interrupt driven in normal operation: the platform
/// ISR hands each byte to the stack's ISR handle. [`Console::try_get`]
/// exists for the bootloader handshake, which runs with the receive
/// interrupt quiesced and polls the line instead.
pub trait Console {
    /// Enables the line with the given configuration.
    fn enable(&self, config: &ConsoleConfig);

    /// Disables the line. Pending output may be dropped.
    fn disable(&self);

    /// True when a byte can be written without blocking.
    fn can_put(&self) -> bool;

    /// Writes one byte. Call only after [`Console::can_put`] returned true.
    fn put(&self, byte: u8);

    /// Reads one byte if available, by polling. Only meaningful while the
    /// receive interrupt is disabled.
    fn try_get(&self) -> Option<u8>;

    /// Gates the receive interrupt. The stack masks it when the receive
    /// FIFO nears capacity and unmasks it after draining.
    fn set_rx_irq_enabled(&self, enabled: bool);

    /// Discards any buffered input and output.
    fn flush(&self);
}
