//! PDUs used on the L2CAP signaling channel (`0x0001`).
//!
//! Every signaling PDU starts with a 4-byte header: a code identifying the PDU, an identifier
//! matching responses to requests, and the length of the payload that follows. This stack
//! originates requests with a monotonically increasing identifier and echoes the peer's
//! identifier in responses.

use super::Channel;
use crate::bytes::*;
use crate::Error;

enum_with_unknown! {
    /// Codes of the signaling PDUs handled by this stack.
    ///
    /// Anything else that shows up on the signaling channel is ignored.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Code(u8) {
        CommandReject = 0x01,
        ConnectionRequest = 0x02,
        ConnectionResponse = 0x03,
        ConfigureRequest = 0x04,
        ConfigureResponse = 0x05,
        DisconnectRequest = 0x06,
        DisconnectResponse = 0x07,
    }
}

/// Result code for an accepted connection request.
pub const RESULT_SUCCESS: u16 = 0x0000;

/// Result code reporting that the connection is still pending.
pub const RESULT_PENDING: u16 = 0x0001;

/// Result code refusing a connection request (no such service).
pub const RESULT_REFUSED: u16 = 0x0004;

/// Configuration option type carrying the MTU.
pub const OPTION_MTU: u8 = 0x01;

/// Size of the MTU option value.
pub const OPTION_MTU_LEN: u8 = 0x02;

/// The header preceding every signaling PDU.
#[derive(Debug, Copy, Clone)]
pub struct Header {
    pub code: Code,
    pub identifier: u8,
    pub length: u16,
}

impl Header {
    /// The size of a signaling header in bytes.
    pub const SIZE: u16 = 4;
}

impl FromBytes<'_> for Header {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(Header {
            code: Code::from(bytes.read_u8()?),
            identifier: bytes.read_u8()?,
            length: bytes.read_u16_le()?,
        })
    }
}

impl ToBytes for Header {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.code.into())?;
        writer.write_u8(self.identifier)?;
        writer.write_u16_le(self.length)
    }
}

/// The signaling PDUs this stack sends.
///
/// Configuration only ever carries the MTU option; none of the peers this stack talks to use
/// anything else.
#[derive(Debug, Copy, Clone)]
pub enum Pdu {
    /// Opens a channel for `psm`; `source_cid` is the CID we assign to our end.
    ConnectionRequest { psm: u16, source_cid: Channel },
    /// Answers a peer's connection request. `destination_cid` is our end, `source_cid` theirs.
    ConnectionResponse {
        destination_cid: Channel,
        source_cid: Channel,
        result: u16,
    },
    /// Asks the peer to apply our channel parameters.
    ConfigureRequest { destination_cid: Channel, mtu: u16 },
    /// Acknowledges the peer's parameters, echoing the MTU.
    ConfigureResponse { source_cid: Channel, mtu: u16 },
    /// Starts tearing down a channel.
    DisconnectRequest {
        destination_cid: Channel,
        source_cid: Channel,
    },
    /// Acknowledges a teardown.
    DisconnectResponse {
        destination_cid: Channel,
        source_cid: Channel,
    },
}

impl Pdu {
    pub fn code(&self) -> Code {
        match self {
            Pdu::ConnectionRequest { .. } => Code::ConnectionRequest,
            Pdu::ConnectionResponse { .. } => Code::ConnectionResponse,
            Pdu::ConfigureRequest { .. } => Code::ConfigureRequest,
            Pdu::ConfigureResponse { .. } => Code::ConfigureResponse,
            Pdu::DisconnectRequest { .. } => Code::DisconnectRequest,
            Pdu::DisconnectResponse { .. } => Code::DisconnectResponse,
        }
    }

    /// Payload length announced in the header.
    pub fn length(&self) -> u16 {
        match self {
            Pdu::ConnectionRequest { .. } => 4,
            Pdu::ConnectionResponse { .. } => 8,
            Pdu::ConfigureRequest { .. } => 8,
            Pdu::ConfigureResponse { .. } => 10,
            Pdu::DisconnectRequest { .. } => 4,
            Pdu::DisconnectResponse { .. } => 4,
        }
    }
}

/// A complete signaling frame: header plus PDU payload.
#[derive(Debug, Copy, Clone)]
pub struct Frame {
    pub identifier: u8,
    pub pdu: Pdu,
}

impl Frame {
    /// Number of bytes `to_bytes` will produce.
    pub fn wire_len(&self) -> usize {
        usize::from(Header::SIZE + self.pdu.length())
    }
}

impl ToBytes for Frame {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        Header {
            code: self.pdu.code(),
            identifier: self.identifier,
            length: self.pdu.length(),
        }
        .to_bytes(writer)?;

        match self.pdu {
            Pdu::ConnectionRequest { psm, source_cid } => {
                writer.write_u16_le(psm)?;
                source_cid.to_bytes(writer)
            }
            Pdu::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
            } => {
                destination_cid.to_bytes(writer)?;
                source_cid.to_bytes(writer)?;
                writer.write_u16_le(result)?;
                writer.write_u16_le(0x0000) // status: no further information
            }
            Pdu::ConfigureRequest {
                destination_cid,
                mtu,
            } => {
                destination_cid.to_bytes(writer)?;
                writer.write_u16_le(0x0000)?; // flags
                writer.write_u8(OPTION_MTU)?;
                writer.write_u8(OPTION_MTU_LEN)?;
                writer.write_u16_le(mtu)
            }
            Pdu::ConfigureResponse { source_cid, mtu } => {
                source_cid.to_bytes(writer)?;
                writer.write_u16_le(0x0000)?; // flags
                writer.write_u16_le(RESULT_SUCCESS)?;
                writer.write_u8(OPTION_MTU)?;
                writer.write_u8(OPTION_MTU_LEN)?;
                writer.write_u16_le(mtu)
            }
            Pdu::DisconnectRequest {
                destination_cid,
                source_cid,
            }
            | Pdu::DisconnectResponse {
                destination_cid,
                source_cid,
            } => {
                destination_cid.to_bytes(writer)?;
                source_cid.to_bytes(writer)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> std::vec::Vec<u8> {
        let mut buf = [0; 32];
        let mut writer = ByteWriter::new(&mut buf);
        frame.to_bytes(&mut writer).unwrap();
        let left = writer.space_left();
        let used = buf.len() - left;
        assert_eq!(used, frame.wire_len());
        buf[..used].to_vec()
    }

    #[test]
    fn connection_request_wire_format() {
        let bytes = encode(Frame {
            identifier: 3,
            pdu: Pdu::ConnectionRequest {
                psm: super::super::PSM_HID_INTERRUPT,
                source_cid: Channel::new(0x0041),
            },
        });
        assert_eq!(bytes, [0x02, 0x03, 0x04, 0x00, 0x13, 0x00, 0x41, 0x00]);
    }

    #[test]
    fn configure_response_echoes_the_mtu() {
        let bytes = encode(Frame {
            identifier: 9,
            pdu: Pdu::ConfigureResponse {
                source_cid: Channel::new(0x0050),
                mtu: 0x00B9,
            },
        });
        assert_eq!(
            bytes,
            [0x05, 0x09, 0x0A, 0x00, 0x50, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0xB9, 0x00]
        );
    }

    #[test]
    fn header_round_trip() {
        let bytes = encode(Frame {
            identifier: 0xFF,
            pdu: Pdu::DisconnectRequest {
                destination_cid: Channel::new(0x0050),
                source_cid: Channel::new(0x0040),
            },
        });
        let header = Header::from_bytes(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(header.code, Code::DisconnectRequest);
        assert_eq!(header.identifier, 0xFF);
        assert_eq!(header.length, 4);
    }
}
