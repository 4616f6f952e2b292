//! Parsing of inbound HCI events.
//!
//! Events arrive as H4 frames: the type byte `0x04`, the event code, a parameter length, and the
//! parameters. The structures here decode the parameter blocks of the events this stack reacts
//! to; everything is little-endian except the class-of-device triplet, which this stack handles
//! MSB-first throughout.

use super::cmd::Opcode;
use super::{BdAddr, InquiryResult};
use crate::bytes::*;
use crate::Error;

enum_with_unknown! {
    /// Event codes dispatched by the engine.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum EventCode(u8) {
        InquiryComplete = 0x01,
        InquiryResult = 0x02,
        ConnectionComplete = 0x03,
        ConnectionRequest = 0x04,
        DisconnectionComplete = 0x05,
        RemoteNameRequestComplete = 0x07,
        CommandComplete = 0x0E,
        PinCodeRequest = 0x16,
        LinkKeyRequest = 0x17,
    }
}

/// Command-complete event: the controller finished executing a command.
///
/// The first byte of `parameters` is the status for every command this stack issues.
pub struct CommandComplete<'a> {
    pub opcode: Opcode,
    pub status: u8,
    /// Return parameters following the status byte.
    pub parameters: &'a [u8],
}

impl<'a> CommandComplete<'a> {
    pub fn parse(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let _num_packets = bytes.read_u8()?;
        let opcode = Opcode(bytes.read_u16_le()?);
        let status = bytes.read_u8()?;
        Ok(CommandComplete {
            opcode,
            status,
            parameters: bytes.read_rest(),
        })
    }
}

/// One 14-byte record of an inquiry-result event.
pub fn parse_inquiry_record(bytes: &mut ByteReader<'_>) -> Result<InquiryResult, Error> {
    let bdaddr = BdAddr::from_bytes(bytes)?;
    let psrm = bytes.read_u8()?;
    bytes.skip(2)?; // reserved
    let class_of_device = bytes.read_u24_be()?;
    let clock_offset = bytes.read_u16_le()?;
    Ok(InquiryResult {
        bdaddr,
        psrm,
        class_of_device,
        clock_offset,
    })
}

/// Connection-complete event: an ACL link came up (or failed to).
#[derive(Debug)]
pub struct ConnectionComplete {
    pub status: u8,
    pub handle: u16,
    pub bdaddr: BdAddr,
}

impl ConnectionComplete {
    pub fn parse(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let status = bytes.read_u8()?;
        let handle = bytes.read_u16_le()? & 0x0FFF;
        let bdaddr = BdAddr::from_bytes(bytes)?;
        // Link type and encryption mode follow; nothing here needs them.
        Ok(ConnectionComplete {
            status,
            handle,
            bdaddr,
        })
    }
}

/// Connection-request event: a peer is paging us.
pub fn parse_connection_request(
    bytes: &mut ByteReader<'_>,
) -> Result<super::ConnectionRequest, Error> {
    let bdaddr = BdAddr::from_bytes(bytes)?;
    let class_of_device = bytes.read_u24_be()?;
    Ok(super::ConnectionRequest {
        bdaddr,
        class_of_device,
    })
}

/// Disconnection-complete event.
pub struct DisconnectionComplete {
    pub status: u8,
    pub handle: u16,
    pub reason: u8,
}

impl DisconnectionComplete {
    pub fn parse(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let status = bytes.read_u8()?;
        let handle = bytes.read_u16_le()? & 0x0FFF;
        let reason = bytes.read_u8()?;
        Ok(DisconnectionComplete {
            status,
            handle,
            reason,
        })
    }
}

/// Remote-name-request-complete event.
pub struct RemoteNameComplete<'a> {
    pub status: u8,
    pub bdaddr: BdAddr,
    /// The remote name up to (not including) its NUL terminator.
    pub name: &'a [u8],
}

impl<'a> RemoteNameComplete<'a> {
    pub fn parse(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let status = bytes.read_u8()?;
        let bdaddr = BdAddr::from_bytes(bytes)?;
        let rest = bytes.read_rest();
        let name = match rest.iter().position(|&b| b == 0) {
            Some(nul) => &rest[..nul],
            None => rest,
        };
        Ok(RemoteNameComplete {
            status,
            bdaddr,
            name,
        })
    }
}

/// PIN-code-request and link-key-request events carry just the peer address up front.
pub fn parse_bdaddr(bytes: &mut ByteReader<'_>) -> Result<BdAddr, Error> {
    BdAddr::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_complete_splits_status_and_parameters() {
        let raw = [0x01, 0x09, 0x10, 0x00, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00];
        let event = CommandComplete::parse(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(event.opcode, super::super::cmd::READ_BD_ADDR);
        assert_eq!(event.status, 0x00);
        assert_eq!(event.parameters, &[0x55, 0x44, 0x33, 0x22, 0x11, 0x00]);
    }

    #[test]
    fn inquiry_record_layout() {
        let raw = [
            0x55, 0x44, 0x33, 0x22, 0x11, 0x00, // bdaddr, LSB first
            0x01, // page scan repetition mode
            0x00, 0x00, // reserved
            0x04, 0x25, 0x00, // class of device
            0x34, 0x12, // clock offset
        ];
        let record = parse_inquiry_record(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(record.bdaddr, BdAddr::new([0x55, 0x44, 0x33, 0x22, 0x11, 0x00]));
        assert_eq!(record.psrm, 0x01);
        assert_eq!(record.class_of_device, 0x042500);
        assert_eq!(record.clock_offset, 0x1234);
    }

    #[test]
    fn remote_name_stops_at_the_terminator() {
        let mut raw = std::vec::Vec::new();
        raw.push(0x00);
        raw.extend_from_slice(&[0x55, 0x44, 0x33, 0x22, 0x11, 0x00]);
        raw.extend_from_slice(b"Nintendo RVL-WBC-01\0\0garbage");
        let event = RemoteNameComplete::parse(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(event.name, b"Nintendo RVL-WBC-01");
    }

    #[test]
    fn truncated_events_are_rejected() {
        let raw = [0x00, 0x41];
        assert_eq!(
            ConnectionComplete::parse(&mut ByteReader::new(&raw)).unwrap_err(),
            Error::Eof
        );
    }
}
