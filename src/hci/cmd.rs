//! HCI command and ACL frame builders.
//!
//! Every outbound frame is packed straight into a TX ring lease: H4 type byte, then the fixed
//! command or ACL preamble, then the parameters. A builder only fails when the ring has no slot
//! left; in that case the frame is dropped with a warning and `false` is returned, so the caller
//! can decide whether the state machine will retry naturally.

use super::{BdAddr, ScanMode};
use crate::bytes::*;
use crate::l2cap::{signaling, Channel};
use crate::ring::FrameRing;
use crate::Error;
use core::fmt;

/// H4 packet type for commands (host to controller).
pub const H4_COMMAND: u8 = 0x01;

/// H4 packet type for ACL data (both directions).
pub const H4_ACL: u8 = 0x02;

/// H4 packet type for events (controller to host).
pub const H4_EVENT: u8 = 0x04;

/// Bytes preceding the parameters of a command: H4 type, opcode, parameter length.
const COMMAND_PREAMBLE: usize = 4;

/// Bytes preceding the L2CAP header of an ACL frame: H4 type, handle/flags, data length.
const ACL_PREAMBLE: usize = 5;

/// Size of the basic L2CAP header: payload length and destination CID.
const L2CAP_HEADER: usize = 4;

/// Packet boundary flag: first packet of a non-automatically-flushable L2CAP message.
///
/// This stack never fragments, so every frame in either direction carries this value.
pub const PB_FIRST: u16 = 0b10;

/// Broadcast flag: point-to-point.
pub const BF_POINT_TO_POINT: u16 = 0b00;

/// An HCI command opcode: the opcode group in the upper 6 bits, the command in the lower 10.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Opcode(pub u16);

impl Opcode {
    pub const fn new(ogf: u16, ocf: u16) -> Self {
        Opcode((ogf << 10) | ocf)
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}

const OGF_LINK_CONTROL: u16 = 0x01;
const OGF_CONTROLLER_BASEBAND: u16 = 0x03;
const OGF_INFORMATIONAL: u16 = 0x04;

pub const INQUIRY: Opcode = Opcode::new(OGF_LINK_CONTROL, 0x0001);
pub const INQUIRY_CANCEL: Opcode = Opcode::new(OGF_LINK_CONTROL, 0x0002);
pub const CREATE_CONNECTION: Opcode = Opcode::new(OGF_LINK_CONTROL, 0x0005);
pub const DISCONNECT: Opcode = Opcode::new(OGF_LINK_CONTROL, 0x0006);
/// Reject replies reuse this opcode, with the rejection reason in place of the role byte.
pub const ACCEPT_CONNECTION: Opcode = Opcode::new(OGF_LINK_CONTROL, 0x0009);
pub const LINK_KEY_NEGATIVE_REPLY: Opcode = Opcode::new(OGF_LINK_CONTROL, 0x000C);
pub const PIN_CODE_REPLY: Opcode = Opcode::new(OGF_LINK_CONTROL, 0x000D);
pub const AUTHENTICATION_REQUESTED: Opcode = Opcode::new(OGF_LINK_CONTROL, 0x0011);
pub const REMOTE_NAME_REQUEST: Opcode = Opcode::new(OGF_LINK_CONTROL, 0x0019);

pub const RESET: Opcode = Opcode::new(OGF_CONTROLLER_BASEBAND, 0x0003);
pub const WRITE_LOCAL_NAME: Opcode = Opcode::new(OGF_CONTROLLER_BASEBAND, 0x0013);
pub const WRITE_SCAN_ENABLE: Opcode = Opcode::new(OGF_CONTROLLER_BASEBAND, 0x001A);
pub const WRITE_CLASS_OF_DEVICE: Opcode = Opcode::new(OGF_CONTROLLER_BASEBAND, 0x0024);

pub const READ_BD_ADDR: Opcode = Opcode::new(OGF_INFORMATIONAL, 0x0009);

/// Packs one command frame into a TX ring lease.
///
/// `fill` must write exactly `params` bytes of command parameters.
fn command<const N: usize>(
    ring: &mut FrameRing<N>,
    opcode: Opcode,
    params: usize,
    fill: impl FnOnce(&mut ByteWriter<'_>) -> Result<(), Error>,
) -> bool {
    let mut lease = match ring.allocate(COMMAND_PREAMBLE + params) {
        Some(lease) => lease,
        None => {
            warn!("TX ring full, dropping command {:?}", opcode);
            return false;
        }
    };

    let ok = {
        let mut writer = ByteWriter::new(&mut lease);
        let res = writer
            .write_u8(H4_COMMAND)
            .and_then(|()| writer.write_u16_le(opcode.0))
            .and_then(|()| writer.write_u8(params as u8))
            .and_then(|()| fill(&mut writer));
        res.is_ok() && writer.space_left() == 0
    };

    if ok {
        lease.commit();
    } else {
        error!("command {:?} did not fill its parameter block", opcode);
    }
    ok
}

pub fn reset<const N: usize>(ring: &mut FrameRing<N>) -> bool {
    command(ring, RESET, 0, |_| Ok(()))
}

pub fn read_bd_addr<const N: usize>(ring: &mut FrameRing<N>) -> bool {
    command(ring, READ_BD_ADDR, 0, |_| Ok(()))
}

/// The controller expects the full 248-byte name block, NUL-padded.
pub fn write_local_name<const N: usize>(ring: &mut FrameRing<N>, name: &[u8]) -> bool {
    if name.len() > 248 {
        error!("local name of {} bytes does not fit", name.len());
        return false;
    }
    command(ring, WRITE_LOCAL_NAME, 248, |writer| {
        writer.write_slice(name)?;
        for _ in name.len()..248 {
            writer.write_u8(0)?;
        }
        Ok(())
    })
}

pub fn write_class_of_device<const N: usize>(ring: &mut FrameRing<N>, class_of_device: u32) -> bool {
    command(ring, WRITE_CLASS_OF_DEVICE, 3, |writer| {
        writer.write_u24_be(class_of_device)
    })
}

pub fn write_scan_enable<const N: usize>(ring: &mut FrameRing<N>, mode: ScanMode) -> bool {
    command(ring, WRITE_SCAN_ENABLE, 1, |writer| writer.write_u8(mode.bits()))
}

pub fn inquiry<const N: usize>(
    ring: &mut FrameRing<N>,
    lap: u32,
    duration: u8,
    max_responses: u8,
) -> bool {
    command(ring, INQUIRY, 5, |writer| {
        writer.write_u24_le(lap)?;
        writer.write_u8(duration)?;
        writer.write_u8(max_responses)
    })
}

pub fn inquiry_cancel<const N: usize>(ring: &mut FrameRing<N>) -> bool {
    command(ring, INQUIRY_CANCEL, 0, |_| Ok(()))
}

pub fn remote_name_request<const N: usize>(
    ring: &mut FrameRing<N>,
    bdaddr: BdAddr,
    psrm: u8,
    clock_offset: u16,
) -> bool {
    command(ring, REMOTE_NAME_REQUEST, 10, |writer| {
        bdaddr.to_bytes(writer)?;
        writer.write_u8(psrm)?;
        writer.write_u8(0)?; // reserved
        writer.write_u16_le(clock_offset)
    })
}

pub fn create_connection<const N: usize>(
    ring: &mut FrameRing<N>,
    bdaddr: BdAddr,
    packet_type: u16,
    psrm: u8,
    clock_offset: u16,
    allow_role_switch: u8,
) -> bool {
    command(ring, CREATE_CONNECTION, 13, |writer| {
        bdaddr.to_bytes(writer)?;
        writer.write_u16_le(packet_type)?;
        writer.write_u8(psrm)?;
        writer.write_u8(0)?; // reserved
        writer.write_u16_le(clock_offset)?;
        writer.write_u8(allow_role_switch)
    })
}

pub fn authentication_requested<const N: usize>(ring: &mut FrameRing<N>, handle: u16) -> bool {
    command(ring, AUTHENTICATION_REQUESTED, 2, |writer| {
        writer.write_u16_le(handle & 0x0FFF)
    })
}

pub fn accept_connection<const N: usize>(ring: &mut FrameRing<N>, bdaddr: BdAddr) -> bool {
    command(ring, ACCEPT_CONNECTION, 7, |writer| {
        bdaddr.to_bytes(writer)?;
        writer.write_u8(0) // role: remain master
    })
}

pub fn reject_connection<const N: usize>(
    ring: &mut FrameRing<N>,
    bdaddr: BdAddr,
    reason: u8,
) -> bool {
    command(ring, ACCEPT_CONNECTION, 7, |writer| {
        bdaddr.to_bytes(writer)?;
        writer.write_u8(reason)
    })
}

pub fn link_key_negative_reply<const N: usize>(ring: &mut FrameRing<N>, bdaddr: BdAddr) -> bool {
    command(ring, LINK_KEY_NEGATIVE_REPLY, 6, |writer| bdaddr.to_bytes(writer))
}

pub fn pin_code_reply<const N: usize>(
    ring: &mut FrameRing<N>,
    bdaddr: BdAddr,
    pin: &[u8],
) -> bool {
    if pin.len() > 16 {
        error!("PIN of {} bytes is too long", pin.len());
        return false;
    }
    command(ring, PIN_CODE_REPLY, 23, |writer| {
        bdaddr.to_bytes(writer)?;
        writer.write_u8(pin.len() as u8)?;
        writer.write_slice(pin)?;
        for _ in pin.len()..16 {
            writer.write_u8(0)?;
        }
        Ok(())
    })
}

pub fn disconnect<const N: usize>(ring: &mut FrameRing<N>, handle: u16, reason: u8) -> bool {
    command(ring, DISCONNECT, 3, |writer| {
        writer.write_u16_le(handle & 0x0FFF)?;
        writer.write_u8(reason)
    })
}

/// Packs one ACL frame carrying a single (unfragmented) L2CAP packet.
///
/// `fill` must write exactly `payload` bytes of L2CAP payload.
fn acl<const N: usize>(
    ring: &mut FrameRing<N>,
    handle: u16,
    channel: Channel,
    payload: usize,
    fill: impl FnOnce(&mut ByteWriter<'_>) -> Result<(), Error>,
) -> bool {
    let mut lease = match ring.allocate(ACL_PREAMBLE + L2CAP_HEADER + payload) {
        Some(lease) => lease,
        None => {
            warn!("TX ring full, dropping ACL frame for {:?}", channel);
            return false;
        }
    };

    let ok = {
        let mut writer = ByteWriter::new(&mut lease);
        let res = writer
            .write_u8(H4_ACL)
            .and_then(|()| {
                writer.write_u16_le(
                    (handle & 0x0FFF) | (PB_FIRST << 12) | (BF_POINT_TO_POINT << 14),
                )
            })
            .and_then(|()| writer.write_u16_le((L2CAP_HEADER + payload) as u16))
            .and_then(|()| writer.write_u16_le(payload as u16))
            .and_then(|()| channel.to_bytes(&mut writer))
            .and_then(|()| fill(&mut writer));
        res.is_ok() && writer.space_left() == 0
    };

    if ok {
        lease.commit();
    } else {
        error!("ACL frame for {:?} did not fill its payload", channel);
    }
    ok
}

/// Sends a signaling frame on the signaling channel of `handle`.
pub fn signaling_frame<const N: usize>(
    ring: &mut FrameRing<N>,
    handle: u16,
    frame: &signaling::Frame,
) -> bool {
    acl(ring, handle, Channel::SIGNALING, frame.wire_len(), |writer| {
        frame.to_bytes(writer)
    })
}

/// Sends raw payload bytes on a data channel of `handle`.
pub fn acl_data<const N: usize>(
    ring: &mut FrameRing<N>,
    handle: u16,
    channel: Channel,
    data: &[u8],
) -> bool {
    acl(ring, handle, channel, data.len(), |writer| {
        writer.write_slice(data)
    })
}
