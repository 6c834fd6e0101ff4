//! Control-plane dispatch for unsolicited frames
//!
//! Handlers here run on the framer path and must not issue requests
//! themselves; doing so would re-enter the framer from the same task.
//! They extract what they need into callback-buffer slots or pending
//! flags and post events that the driver task replays to the client.

use core::sync::atomic::Ordering;

use heapless::String;
use ncplink_core::{ChangeFlags, Command, DeviceRole, Error, PropKey, Status};

use crate::codec::Unpacker;
use crate::config::{LEGACY_ULA_SIZE, NUM_CALLBACK_BUFFERS};
use crate::driver::Client;
use crate::net;
use crate::state::{Event, State};

/// Properties of one received datagram.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DatagramMeta {
    /// Carried on the secure stream.
    pub secure: bool,
    /// Arrived via the vendor legacy channel.
    pub legacy: bool,
}

/// One beacon from an active scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub channel: u8,
    pub rssi: i8,
    pub ext_address: [u8; 8],
    pub pan_id: u16,
    pub lqi: u8,
    pub network_name: String<16>,
    pub ext_pan_id: [u8; 8],
    pub joinable: bool,
}

const BEACON_FLAG_JOINABLE: u8 = 0x01;

/// Content parked between the decode path and its deferred event.
pub(crate) enum Slot {
    Free,
    ScanResult(ScanResult),
    LegacyUla([u8; LEGACY_ULA_SIZE]),
}

pub(crate) struct DispatchState {
    pub pending_flags: ChangeFlags,
    pub slots: [Slot; NUM_CALLBACK_BUFFERS],
    pub last_status: Status,
}

impl DispatchState {
    pub fn new() -> Self {
        Self {
            pending_flags: ChangeFlags::NONE,
            slots: [const { Slot::Free }; NUM_CALLBACK_BUFFERS],
            last_status: Status::OK,
        }
    }

    pub fn reset(&mut self) {
        self.pending_flags = ChangeFlags::NONE;
        for slot in &mut self.slots {
            *slot = Slot::Free;
        }
    }

    fn alloc_slot(&mut self) -> Option<&mut Slot> {
        let slot = self.slots.iter_mut().find(|s| matches!(s, Slot::Free));
        if slot.is_none() {
            error!("failed to allocate callback buffer");
        }
        slot
    }
}

/// Records a last-status report. Returns true when the code announces an
/// NCP reset, which the supervisor answers with recovery.
pub(crate) fn handle_last_status(dispatch: &mut DispatchState, args: &[u8]) -> bool {
    let Ok(code) = Unpacker::new(args).get_uint_packed() else {
        error!("failed to parse last-status report");
        return false;
    };

    let status = Status::new(code);
    dispatch.last_status = status;
    info!("NCP status report: {}", code);

    status.is_reset()
}

/// Classifies an unsolicited control frame. Returns true when the
/// supervisor must initiate recovery.
pub(crate) fn receive_control(
    dispatch: &mut DispatchState,
    state: &State<'_>,
    command: Command,
    key: PropKey,
    args: &[u8],
) -> bool {
    let prev_flags = dispatch.pending_flags;
    let mut recover = false;

    if command == Command::PROP_VALUE_IS {
        match key {
            PropKey::LAST_STATUS => recover = handle_last_status(dispatch, args),

            PropKey::NET_ROLE => match Unpacker::new(args).get_u8() {
                Ok(wire) => {
                    state.set_role(DeviceRole::from_wire(wire));
                    dispatch.pending_flags.insert(ChangeFlags::ROLE);
                }
                Err(_) => error!("failed to parse role update"),
            },

            #[cfg(feature = "legacy-alarm")]
            PropKey::VENDOR_LEGACY_ULA_PREFIX => handle_legacy_ula(dispatch, state, args),

            PropKey::MAC_SCAN_STATE => state.post(Event::ScanComplete),

            PropKey::THREAD_CHILD_TABLE => log_child_table(args),

            PropKey::IPV6_ADDRESS_TABLE => {
                // Also sent for removals; subscribers re-read the table
                // either way.
                dispatch.pending_flags.insert(ChangeFlags::IP6_ADDRESS);
            }

            PropKey::IPV6_MULTICAST_ADDRESS_TABLE => {
                dispatch.pending_flags.insert(ChangeFlags::IP6_MULTICAST);
            }

            #[cfg(feature = "log-ncp-logs")]
            PropKey::STREAM_DEBUG => log_debug_stream(args),

            #[cfg(feature = "legacy-alarm")]
            PropKey::VENDOR_NETWORK_WAKE_STATE => handle_network_wake(state, args),

            _ => {} // Ignore this control frame.
        }

        if prev_flags.is_empty() && !dispatch.pending_flags.is_empty() {
            state.post(Event::StateChanged);
        }
    } else if command == Command::PROP_VALUE_INSERTED && key == PropKey::MAC_SCAN_BEACON {
        match parse_scan_beacon(args) {
            Ok(result) => {
                if let Some(slot) = dispatch.alloc_slot() {
                    *slot = Slot::ScanResult(result);
                    state.post(Event::ScanResult);
                }
            }
            Err(_) => error!("failed to parse scan beacon"),
        }
    }

    recover
}

/// Hands one inbound datagram to the upper stack and maintains the
/// provisional-join window.
pub(crate) fn receive_datagram<CL: Client>(
    state: &State<'_>,
    client: &mut CL,
    command: Command,
    key: PropKey,
    args: &[u8],
) {
    let mut unpacker = Unpacker::new(args);
    let payload = unpacker.take_rest();

    let secure = key != PropKey::STREAM_NET_INSECURE;
    let legacy = cfg!(feature = "vendor") && command == Command::VENDOR_PROP_VALUE_IS;

    if secure && state.security().assisting_provisional_join() {
        let port = state.insecure_src_port.load(Ordering::Relaxed);
        if net::tcp_dst_port(payload) == Some(port) {
            // The joiner switched to link security; the provisional
            // window closes and responses go out secured from here on.
            state.update_security(|flags| {
                flags.insert(ncplink_core::SecurityFlags::SECURE_MSG_ON_INSECURE_PORT)
            });
            info!("received secure message on insecure port");
        }
    }

    trace!("IP RX len: {} secure: {}", payload.len(), secure);
    client.on_datagram(payload, DatagramMeta { secure, legacy });
}

#[cfg(feature = "legacy-alarm")]
fn handle_legacy_ula(dispatch: &mut DispatchState, state: &State<'_>, args: &[u8]) {
    let Some(slot) = dispatch.alloc_slot() else {
        return;
    };

    let mut unpacker = Unpacker::new(args);
    let data = unpacker.take_rest();
    let Some(prefix) = data.get(..LEGACY_ULA_SIZE) else {
        error!("failed to parse legacy ula");
        return;
    };

    let mut ula = [0u8; LEGACY_ULA_SIZE];
    ula.copy_from_slice(prefix);
    *slot = Slot::LegacyUla(ula);
    state.post(Event::LegacyUla);
}

#[cfg(feature = "legacy-alarm")]
fn handle_network_wake(state: &State<'_>, args: &[u8]) {
    let parsed = (|| {
        let mut group = Unpacker::new(args).get_struct()?;
        let time_remaining = group.get_u16()?;
        let event = group.get_u8()?;
        let reason = group.get_u8()?;
        Ok::<_, Error>((event, time_remaining, reason))
    })();

    match parsed {
        Ok((event, time_remaining, reason)) => state.post(Event::LegacyWake {
            event,
            time_remaining,
            reason,
        }),
        Err(_) => error!("failed to parse network wake state"),
    }
}

fn parse_scan_beacon(args: &[u8]) -> Result<ScanResult, Error> {
    let mut unpacker = Unpacker::new(args);
    let channel = unpacker.get_u8()?;
    let rssi = unpacker.get_i8()?;

    let mut mac = unpacker.get_struct()?;
    let ext_address = *mac.get_eui64()?;
    let _saddr = mac.get_u16()?;
    let pan_id = mac.get_u16()?;
    let lqi = mac.get_u8()?;

    let mut network = unpacker.get_struct()?;
    let _protocol = network.get_uint_packed()?;
    let flags = network.get_u8()?;
    let name = network.get_utf8()?;
    let xpanid = network.take_rest();

    let mut network_name = String::new();
    let _ = network_name.push_str(name.get(..16).unwrap_or(name));

    let mut ext_pan_id = [0u8; 8];
    let n = xpanid.len().min(8);
    ext_pan_id[..n].copy_from_slice(&xpanid[..n]);

    Ok(ScanResult {
        channel,
        rssi,
        ext_address,
        pan_id,
        lqi,
        network_name,
        ext_pan_id,
        joinable: flags & BEACON_FLAG_JOINABLE != 0,
    })
}

/// Logs the child-table snapshot the NCP pushes after membership changes.
fn log_child_table(args: &[u8]) {
    let mut unpacker = Unpacker::new(args);
    let mut index = 0u16;

    while !unpacker.is_empty() {
        let entry = (|| {
            let mut child = unpacker.get_struct()?;
            let _eui64 = child.get_eui64()?;
            let rloc16 = child.get_u16()?;
            let _timeout = child.get_u32()?;
            let age = child.get_u32()?;
            let _network_data_version = child.get_u8()?;
            let _link_quality_in = child.get_u8()?;
            let average_rssi = child.get_i8()?;
            let _mode = child.get_u8()?;
            let last_rssi = child.get_i8()?;
            Ok::<_, Error>((rloc16, age, average_rssi, last_rssi))
        })();

        match entry {
            Ok((rloc16, age, average_rssi, last_rssi)) => {
                index += 1;
                info!(
                    "{}) RLOC={:04x}, Age={}, AvgRSSI={}, LastRSSI={}",
                    index, rloc16, age, average_rssi, last_rssi
                );
            }
            Err(_) => break,
        }
    }

    info!("child table contains {} entries", index);
}

#[cfg(feature = "log-ncp-logs")]
fn log_debug_stream(args: &[u8]) {
    let mut line: String<97> = String::new();

    for (i, &byte) in args.iter().enumerate() {
        let ch = byte as char;
        if ch == '\t' || byte >= 32 {
            let _ = line.push(ch);
        }

        let flush = ch == '\n' || ch == '\r' || line.len() >= 96 || i + 1 == args.len();
        if flush && !line.is_empty() {
            info!("NCP => {}", line.as_str());
            line.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Packer;

    fn beacon_args(name: &str, joinable: bool) -> ([u8; 128], usize) {
        let mut buf = [0u8; 128];
        let mut packer = Packer::new(&mut buf);
        packer.put_u8(17).unwrap();
        packer.put_i8(-60).unwrap();
        packer
            .put_struct(|p| {
                p.put_eui64(&[1, 2, 3, 4, 5, 6, 7, 8])?;
                p.put_u16(0xfffe)?;
                p.put_u16(0xface)?;
                p.put_u8(200)
            })
            .unwrap();
        packer
            .put_struct(|p| {
                p.put_uint_packed(3)?;
                p.put_u8(if joinable { BEACON_FLAG_JOINABLE } else { 0 })?;
                p.put_utf8(name)?;
                p.put_data_raw(&[0xaa; 8])
            })
            .unwrap();
        let len = packer.len();
        (buf, len)
    }

    #[test]
    fn test_parse_scan_beacon() {
        let (buf, len) = beacon_args("OpenThread", true);
        let result = parse_scan_beacon(&buf[..len]).unwrap();

        assert_eq!(result.channel, 17);
        assert_eq!(result.rssi, -60);
        assert_eq!(result.ext_address, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(result.pan_id, 0xface);
        assert_eq!(result.lqi, 200);
        assert_eq!(result.network_name.as_str(), "OpenThread");
        assert_eq!(result.ext_pan_id, [0xaa; 8]);
        assert!(result.joinable);
    }

    #[test]
    fn test_parse_scan_beacon_truncated() {
        let (buf, len) = beacon_args("net", false);
        assert!(parse_scan_beacon(&buf[..len - 12]).is_err());
    }

    #[test]
    fn test_slot_pool_exhaustion() {
        let mut dispatch = DispatchState::new();
        for _ in 0..NUM_CALLBACK_BUFFERS {
            let slot = dispatch.alloc_slot().unwrap();
            *slot = Slot::ScanResult(ScanResult {
                channel: 0,
                rssi: 0,
                ext_address: [0; 8],
                pan_id: 0,
                lqi: 0,
                network_name: String::new(),
                ext_pan_id: [0; 8],
                joinable: false,
            });
        }
        assert!(dispatch.alloc_slot().is_none());

        dispatch.reset();
        assert!(dispatch.alloc_slot().is_some());
    }

    #[test]
    fn test_last_status_reset_range_requests_recovery() {
        let mut dispatch = DispatchState::new();

        let mut buf = [0u8; 8];
        let mut packer = Packer::new(&mut buf);
        packer.put_uint_packed(Status::RESET_SOFTWARE.into_u32()).unwrap();
        assert!(handle_last_status(&mut dispatch, packer.as_slice()));
        assert_eq!(dispatch.last_status, Status::RESET_SOFTWARE);

        let mut buf = [0u8; 8];
        let mut packer = Packer::new(&mut buf);
        packer.put_uint_packed(Status::OK.into_u32()).unwrap();
        assert!(!handle_last_status(&mut dispatch, packer.as_slice()));
        assert_eq!(dispatch.last_status, Status::OK);
    }
}
