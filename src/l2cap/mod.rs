//! The Logical Link Control and Adaptation Protocol (L2CAP), Classic Bluetooth flavor.
//!
//! L2CAP provides "channels" to the upper layers that are mapped to the ACL link below. A channel
//! is identified by a 16-bit ID (also see [`Channel`]), a few of which are reserved:
//!
//! * `0x0000`: The null identifier. Must never be used as a destination endpoint.
//! * `0x0001`: L2CAP signaling channel.
//! * `0x0002`: Connectionless channel.
//! * `0x0040` and up: available for dynamic allocation.
//!
//! Establishing new connection-oriented channels makes use of *Protocol/Service Multiplexers*
//! (PSMs), which are numbers identifying the protocol or service to use. The Wii accessories speak
//! the Bluetooth HID protocol, which occupies two preallocated PSMs: `0x0011` carries HID control
//! traffic and `0x0013` carries HID interrupt traffic (the input/output reports).
//!
//! Each established channel is tracked in a [`ChannelRecord`]; the [`ConnectionStore`] is the flat
//! collection of all live records, keyed either by `(link handle, local CID)` or by
//! `(link handle, PSM)`.
//!
//! [`Channel`]: struct.Channel.html
//! [`ChannelRecord`]: struct.ChannelRecord.html
//! [`ConnectionStore`]: struct.ConnectionStore.html

pub mod signaling;

use crate::bytes::*;
use crate::Error;
use core::fmt;

/// PSM assigned to the Bluetooth HID control channel.
pub const PSM_HID_CONTROL: u16 = 0x0011;

/// PSM assigned to the Bluetooth HID interrupt channel.
pub const PSM_HID_INTERRUPT: u16 = 0x0013;

/// MTU offered to peers for inbound channels before configuration settles.
pub const DEFAULT_MTU: u16 = 0x00B9;

/// An L2CAP channel identifier (CID).
///
/// Channels are basically like TCP ports. Dynamically allocated channels can have different CIDs
/// on the two devices; each signaling exchange names both ends.
#[derive(PartialEq, Eq, Copy, Clone)]
pub struct Channel(u16);

impl Channel {
    /// The null channel identifier. Must not be used as a destination endpoint.
    pub const NULL: Self = Channel(0x0000);

    /// The L2CAP signaling channel (connectionless).
    pub const SIGNALING: Self = Channel(0x0001);

    /// The first CID available for dynamically allocated channels.
    pub const FIRST_DYNAMIC: Self = Channel(0x0040);

    /// Creates a channel identifier from a raw `u16`.
    pub const fn new(raw: u16) -> Self {
        Channel(raw)
    }

    /// Returns the channel identifier (CID) as a raw `u16`.
    pub fn as_raw(&self) -> u16 {
        self.0
    }

    /// Returns whether this CID lies in the dynamically allocated range.
    pub fn is_dynamic(&self) -> bool {
        self.0 >= Self::FIRST_DYNAMIC.0
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}

impl FromBytes<'_> for Channel {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(Channel(bytes.read_u16_le()?))
    }
}

impl ToBytes for Channel {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.0)
    }
}

/// State of one connection-oriented channel on an ACL link.
///
/// A record is created when this host sends a CONNECTION REQUEST or accepts one from the peer,
/// and destroyed when the disconnect handshake completes, when the peer refuses the connection,
/// or when the link itself goes away. The channel counts as *established* once both sides have
/// acknowledged a configuration.
#[derive(Debug, Copy, Clone)]
pub struct ChannelRecord {
    /// Handle of the ACL link carrying the channel.
    pub handle: u16,
    /// CID assigned by this host.
    pub local_cid: Channel,
    /// The protocol/service multiplexer the channel was opened for.
    pub psm: u16,
    /// CID assigned by the peer; `Channel::NULL` until its CONNECTION RESPONSE arrives.
    pub remote_cid: Channel,
    /// Negotiated maximum transmission unit.
    pub mtu: u16,
    /// The peer has acknowledged our CONFIGURATION REQUEST.
    pub local_configured: bool,
    /// We have acknowledged the peer's CONFIGURATION REQUEST.
    pub remote_configured: bool,
}

/// Upper bound of simultaneously tracked channels.
///
/// Every board occupies two channels (HID control and interrupt), so this allows a small handful
/// of boards.
const MAX_CHANNELS: usize = 8;

/// The flat collection of live channel records.
///
/// Lookups walk the underlying vector; the expected cardinality is 2-4 records per board, so
/// anything smarter would be a waste. The store does not deduplicate — keeping `(handle,
/// local CID)` and owned `(handle, PSM)` pairs unique is the caller's responsibility.
pub struct ConnectionStore {
    records: heapless::Vec<ChannelRecord, MAX_CHANNELS>,
}

impl ConnectionStore {
    /// Creates an empty store.
    pub const fn new() -> Self {
        ConnectionStore {
            records: heapless::Vec::new(),
        }
    }

    /// Looks up the record with the given CID assigned by this host.
    pub fn find_local(&mut self, handle: u16, local_cid: Channel) -> Option<&mut ChannelRecord> {
        self.records
            .iter_mut()
            .find(|r| r.handle == handle && r.local_cid == local_cid)
    }

    /// Looks up the record for the given PSM on the given link.
    pub fn find_psm(&mut self, handle: u16, psm: u16) -> Option<&mut ChannelRecord> {
        self.records
            .iter_mut()
            .find(|r| r.handle == handle && r.psm == psm)
    }

    /// Adds a record. Fails (returning it back) when the store is full.
    pub fn emplace(&mut self, record: ChannelRecord) -> Result<(), ChannelRecord> {
        self.records.push(record)
    }

    /// Removes and returns the record with the given local CID.
    pub fn remove(&mut self, handle: u16, local_cid: Channel) -> Option<ChannelRecord> {
        let index = self
            .records
            .iter()
            .position(|r| r.handle == handle && r.local_cid == local_cid)?;
        Some(self.records.swap_remove(index))
    }

    /// Removes and returns one record belonging to `handle`, if any is left.
    ///
    /// Called repeatedly when an ACL link goes away: channels that were never torn down through
    /// signaling go with the link.
    pub fn remove_link(&mut self, handle: u16) -> Option<ChannelRecord> {
        let index = self.records.iter().position(|r| r.handle == handle)?;
        Some(self.records.swap_remove(index))
    }

    /// Returns whether any record for `handle` is still tracked.
    pub fn has_link(&self, handle: u16) -> bool {
        self.records.iter().any(|r| r.handle == handle)
    }
}
