//! NCP link protocol core data types
//!
//! This crate provides basic data type definitions used by other ncplink
//! crates. ncplink users should not depend on this crate directly. Use the
//! `ncplink::core` reexport instead.
#![no_std]

mod status;

pub use status::Status;

/// Error kinds surfaced by the driver and its request surface.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A caller-supplied argument was rejected before anything was sent.
    InvalidArgs,
    /// The operation is not legal in the current session state.
    InvalidState,
    /// A frame or property payload did not parse as the expected types.
    Parse,
    /// A buffer or the outbound store could not satisfy an allocation.
    NoBufs,
    /// No matching response arrived within the deadline.
    NoFrameReceived,
    /// The NCP answered the request with a non-ok last-status.
    Failed,
    /// The NCP acknowledged a reset attempt with an unexpected status.
    NoAck,
    /// The outbound console would not accept bytes within the deadline.
    Busy,
    /// The operation requires a cargo feature that is not enabled.
    DisabledFeature,
    /// The operation is a stub kept for interface compatibility.
    NotImplemented,
}

/// Spinel transaction identifier, the low nibble of the header byte.
///
/// Value 0 is reserved by the protocol and 15 is reserved for future use.
/// Value 1 is claimed as the "don't care" identifier for requests whose
/// response is not awaited by identifier (e.g. post-reset announcements).
/// Ordinary requests draw from 2..=14 round-robin.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Tid(u8);

impl Tid {
    const MAX_VALUE: u8 = 0x0f;

    pub const DONT_CARE: Tid = Tid(1);
    const MIN_ROLLING: u8 = 2;
    const MAX_ROLLING: u8 = 14;

    pub const fn from_u8_truncating(value: u8) -> Self {
        Self(value & Self::MAX_VALUE)
    }

    pub const fn into_u8(self) -> u8 {
        self.0
    }

    pub const fn is_dont_care(self) -> bool {
        self.0 == Self::DONT_CARE.0
    }

    /// The rolling successor, skipping the reserved and don't-care values.
    pub const fn next(self) -> Self {
        let mut value = self.0 + 1;
        if value > Self::MAX_ROLLING || value < Self::MIN_ROLLING {
            value = Self::MIN_ROLLING;
        }
        Self(value)
    }
}

impl Default for Tid {
    fn default() -> Self {
        // The first call to next() then yields the lowest rolling value.
        Tid::DONT_CARE
    }
}

impl From<Tid> for u8 {
    fn from(value: Tid) -> Self {
        value.into_u8()
    }
}

/// Spinel header byte: `[7]=1`, `[6:4]=IID`, `[3:0]=TID`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Header(u8);

impl Header {
    const FLAG: u8 = 0x80;
    const IID_MASK: u8 = 0x70;
    const TID_MASK: u8 = 0x0f;

    /// A header on interface 0 carrying the given transaction identifier.
    pub const fn new(tid: Tid) -> Self {
        Self(Self::FLAG | tid.into_u8())
    }

    pub const fn from_u8(value: u8) -> Self {
        Self(value)
    }

    pub const fn into_u8(self) -> u8 {
        self.0
    }

    pub const fn tid(self) -> Tid {
        Tid::from_u8_truncating(self.0 & Self::TID_MASK)
    }

    pub const fn iid(self) -> u8 {
        (self.0 & Self::IID_MASK) >> 4
    }

    pub const fn is_valid(self) -> bool {
        self.0 & Self::FLAG != 0
    }
}

impl From<Header> for u8 {
    fn from(value: Header) -> Self {
        value.into_u8()
    }
}

/// Spinel command, carried as a packed unsigned integer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Command(u32);

impl Command {
    pub const PROP_VALUE_GET: Command = Command(2);
    pub const PROP_VALUE_SET: Command = Command(3);
    pub const PROP_VALUE_INSERT: Command = Command(4);
    pub const PROP_VALUE_REMOVE: Command = Command(5);
    pub const PROP_VALUE_IS: Command = Command(6);
    pub const PROP_VALUE_INSERTED: Command = Command(7);
    pub const PROP_VALUE_REMOVED: Command = Command(8);
    pub const NET_CLEAR: Command = Command(10);

    pub const VENDOR_PROP_VALUE_GET: Command = Command(0x3c00);
    pub const VENDOR_PROP_VALUE_SET: Command = Command(0x3c01);
    pub const VENDOR_PROP_VALUE_IS: Command = Command(0x3c02);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn into_u32(self) -> u32 {
        self.0
    }

    /// True for the three `*_IS`-family response commands.
    pub const fn is_response(self) -> bool {
        matches!(
            self,
            Command::PROP_VALUE_IS | Command::PROP_VALUE_INSERTED | Command::PROP_VALUE_REMOVED
        )
    }
}

impl From<Command> for u32 {
    fn from(value: Command) -> Self {
        value.into_u32()
    }
}

/// Spinel property key, carried as a packed unsigned integer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PropKey(u32);

impl PropKey {
    pub const LAST_STATUS: PropKey = PropKey(0x00);
    pub const POWER_STATE: PropKey = PropKey(0x02);
    pub const HOST_POWER_STATE: PropKey = PropKey(0x0c);

    pub const PHY_CHAN: PropKey = PropKey(0x21);
    pub const PHY_TX_POWER: PropKey = PropKey(0x25);
    pub const PHY_RSSI: PropKey = PropKey(0x26);

    pub const NET_SAVED: PropKey = PropKey(0x30);
    pub const NET_IF_UP: PropKey = PropKey(0x31);
    pub const NET_STACK_UP: PropKey = PropKey(0x32);
    pub const NET_ROLE: PropKey = PropKey(0x36);
    pub const NET_NETWORK_NAME: PropKey = PropKey(0x37);
    pub const NET_XPANID: PropKey = PropKey(0x38);
    pub const NET_MASTER_KEY: PropKey = PropKey(0x39);
    pub const NET_PARTITION_ID: PropKey = PropKey(0x3a);

    pub const MAC_SCAN_STATE: PropKey = PropKey(0x40);
    pub const MAC_SCAN_MASK: PropKey = PropKey(0x41);
    pub const MAC_SCAN_PERIOD: PropKey = PropKey(0x42);
    pub const MAC_SCAN_BEACON: PropKey = PropKey(0x43);
    pub const MAC_15_4_LADDR: PropKey = PropKey(0x44);
    pub const MAC_15_4_PANID: PropKey = PropKey(0x45);

    pub const NCP_VERSION: PropKey = PropKey(0x52);

    pub const THREAD_ASSISTING_PORTS: PropKey = PropKey(0x60);
    pub const THREAD_ALLOW_LOCAL_NET_DATA_CHANGE: PropKey = PropKey(0x61);
    pub const THREAD_CHILD_TABLE: PropKey = PropKey(0x62);
    pub const THREAD_NEIGHBOR_TABLE: PropKey = PropKey(0x63);
    pub const THREAD_ON_MESH_NETS: PropKey = PropKey(0x64);
    pub const THREAD_OFF_MESH_ROUTES: PropKey = PropKey(0x65);
    pub const THREAD_MODE: PropKey = PropKey(0x66);
    pub const THREAD_RLOC16: PropKey = PropKey(0x68);
    pub const THREAD_LEADER_ADDR: PropKey = PropKey(0x69);
    pub const THREAD_NETWORK_DATA_VERSION: PropKey = PropKey(0x6a);
    pub const THREAD_LEADER_WEIGHT: PropKey = PropKey(0x6c);

    pub const IPV6_ADDRESS_TABLE: PropKey = PropKey(0x70);
    pub const IPV6_MULTICAST_ADDRESS_TABLE: PropKey = PropKey(0x71);
    pub const IPV6_ICMP_PING_OFFLOAD: PropKey = PropKey(0x72);

    pub const STREAM_DEBUG: PropKey = PropKey(0x80);
    pub const STREAM_NET: PropKey = PropKey(0x81);
    pub const STREAM_NET_INSECURE: PropKey = PropKey(0x82);

    pub const VENDOR_LEGACY_ULA_PREFIX: PropKey = PropKey(0x3c00);
    pub const VENDOR_NETWORK_WAKE_STATE: PropKey = PropKey(0x3c01);
    pub const VENDOR_NETWORK_WAKE_CTRL: PropKey = PropKey(0x3c02);
    pub const VENDOR_NETWORK_LURK_CTRL: PropKey = PropKey(0x3c03);
    pub const VENDOR_CREDENTIALS_RECOVERY: PropKey = PropKey(0x3c04);
    pub const VENDOR_CREDENTIALS_ERASE: PropKey = PropKey(0x3c05);
    pub const VENDOR_STREAM_MFG: PropKey = PropKey(0x3c06);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn into_u32(self) -> u32 {
        self.0
    }

    /// True for the datagram streams in either security class.
    pub const fn is_datagram_stream(self) -> bool {
        matches!(self, PropKey::STREAM_NET | PropKey::STREAM_NET_INSECURE)
    }
}

impl From<PropKey> for u32 {
    fn from(value: PropKey) -> Self {
        value.into_u32()
    }
}

/// Device role as reported through the net-role property.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DeviceRole {
    /// The interface is down and the role is not meaningful.
    #[default]
    Disabled,
    /// Attached to no partition.
    Detached,
    Child,
    Router,
    Leader,
}

impl DeviceRole {
    /// Translates the wire encoding, collapsing unknown values to Detached.
    pub const fn from_wire(value: u8) -> Self {
        match value {
            1 => DeviceRole::Child,
            2 => DeviceRole::Router,
            3 => DeviceRole::Leader,
            _ => DeviceRole::Detached,
        }
    }

    /// True when the device participates in a partition.
    pub const fn is_attached(self) -> bool {
        matches!(self, DeviceRole::Child | DeviceRole::Router | DeviceRole::Leader)
    }
}

/// Host power state values for the host-power-state property.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum HostPowerState {
    Offline = 0,
    LowPower = 2,
    Online = 4,
}

impl From<HostPowerState> for u8 {
    fn from(value: HostPowerState) -> Self {
        value as u8
    }
}

/// A set of pending state-change notifications.
///
/// The aggregate is consumed atomically by the state-changed event
/// handler; a zero-to-non-zero transition is what earns a posted event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChangeFlags(u32);

impl ChangeFlags {
    pub const NONE: Self = Self(0);

    pub const ROLE: Self = Self(1 << 0);
    pub const IP6_ADDRESS: Self = Self(1 << 1);
    pub const IP6_MULTICAST: Self = Self(1 << 2);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn into_bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub const fn take(&mut self) -> Self {
        let taken = Self(self.0);
        self.0 = 0;
        taken
    }
}

impl core::ops::BitOr for ChangeFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for ChangeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Link-security state for outgoing datagrams.
///
/// Bits are written only on the driver task; the outbound submit path on
/// the upper-stack task reads a relaxed snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SecurityFlags(u8);

impl SecurityFlags {
    pub const NONE: Self = Self(0);

    /// The thread protocol is started; data packets must be secured.
    pub const THREAD_STARTED: Self = Self(1 << 0);
    /// One or more insecure ports are enabled.
    pub const INSECURE_PORTS_ENABLED: Self = Self(1 << 1);
    /// An insecure source port was opened by the driver itself.
    pub const INSECURE_SOURCE_PORT: Self = Self(1 << 2);
    /// A secure message arrived on the insecure port.
    pub const SECURE_MSG_ON_INSECURE_PORT: Self = Self(1 << 3);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn into_bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub const fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Whether outgoing messages are secured by default.
    pub const fn message_security(self) -> bool {
        self.contains(Self::THREAD_STARTED)
    }

    /// The device is provisionally joining and has not yet opened an
    /// insecure source port.
    pub const fn need_insecure_source_port(self) -> bool {
        !self.message_security()
            && self.contains(Self::INSECURE_PORTS_ENABLED)
            && !self.contains(Self::INSECURE_SOURCE_PORT)
    }

    /// The device is assisting a provisional join: responses on the
    /// insecure port go out unsecured until a secure message is seen there.
    pub const fn assisting_provisional_join(self) -> bool {
        self.message_security()
            && self.contains(Self::INSECURE_PORTS_ENABLED)
            && !self.contains(Self::SECURE_MSG_ON_INSECURE_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_rolls_over_reserved_values() {
        let mut tid = Tid::default();
        let mut seen = [false; 16];

        for _ in 0..32 {
            tid = tid.next();
            let value = tid.into_u8();
            assert!((2..=14).contains(&value));
            seen[value as usize] = true;
        }

        assert!(!seen[0]);
        assert!(!seen[1]);
        assert!(!seen[15]);
        assert!(seen[2..=14].iter().all(|&hit| hit));
    }

    #[test]
    fn test_first_tid_is_two() {
        assert_eq!(Tid::default().next().into_u8(), 2);
    }

    #[test]
    fn test_header_fields() {
        let header = Header::new(Tid::from_u8_truncating(2));
        assert_eq!(header.into_u8(), 0x82);
        assert_eq!(header.tid().into_u8(), 2);
        assert_eq!(header.iid(), 0);
        assert!(header.is_valid());

        assert!(!Header::from_u8(0x02).is_valid());
    }

    #[test]
    fn test_role_translation() {
        assert_eq!(DeviceRole::from_wire(0), DeviceRole::Detached);
        assert_eq!(DeviceRole::from_wire(2), DeviceRole::Router);
        assert_eq!(DeviceRole::from_wire(0xff), DeviceRole::Detached);
        assert!(!DeviceRole::Detached.is_attached());
        assert!(DeviceRole::Leader.is_attached());
    }

    #[test]
    fn test_change_flags_take() {
        let mut flags = ChangeFlags::NONE;
        assert!(flags.is_empty());

        flags.insert(ChangeFlags::ROLE);
        flags |= ChangeFlags::IP6_ADDRESS;
        assert!(flags.contains(ChangeFlags::ROLE));

        let taken = flags.take();
        assert_eq!(taken, ChangeFlags::ROLE | ChangeFlags::IP6_ADDRESS);
        assert!(flags.is_empty());
    }

    #[test]
    fn test_security_predicates() {
        let mut flags = SecurityFlags::NONE;
        flags.insert(SecurityFlags::INSECURE_PORTS_ENABLED);
        assert!(flags.need_insecure_source_port());
        assert!(!flags.assisting_provisional_join());

        flags.insert(SecurityFlags::INSECURE_SOURCE_PORT);
        assert!(!flags.need_insecure_source_port());

        flags.insert(SecurityFlags::THREAD_STARTED);
        assert!(flags.assisting_provisional_join());

        flags.insert(SecurityFlags::SECURE_MSG_ON_INSECURE_PORT);
        assert!(!flags.assisting_provisional_join());
    }
}
