//! The Bluetooth engine: HCI link setup and pairing, L2CAP channel management, and the
//! controller I/O pump.
//!
//! The engine is strictly single-threaded and cooperative. It owns two [`FrameRing`]s — one for
//! frames headed to the controller, one for frames the controller delivered — and everything
//! happens inside [`Host::process`]: one tick first drains the TX ring into the controller while
//! it has buffer credit, then takes at most one RX frame and runs it through the state machines.
//! No transition ever blocks; waiting is expressed as "stay in the current state and re-enter on
//! a later tick".
//!
//! Right after construction the engine walks the controller through its initialization chain,
//! driven entirely by command-complete events:
//!
//! ```notrust
//! RESET -> READ_BD_ADDR -> WRITE_LOCAL_NAME -> WRITE_CLASS_OF_DEVICE -> WRITE_SCAN_ENABLE
//! ```
//!
//! Once the final step completes, [`Delegate::on_ready`] fires and discovery may start. Legacy
//! PIN pairing is answered by the engine itself: link keys are always refused (there is no key
//! store) and the PIN is the Wii shortcut — the host's own address in over-the-air byte order.
//!
//! Everything the application observes arrives through the [`Delegate`] trait as one of two sum
//! types, [`HciEvent`] for link-level events and [`AclEvent`] for channel-level events. Handlers
//! receive a [`Commander`] and may immediately send commands or data from inside the callback.
//!
//! [`FrameRing`]: ../ring/struct.FrameRing.html
//! [`Host::process`]: struct.Host.html#method.process
//! [`Delegate`]: trait.Delegate.html
//! [`Delegate::on_ready`]: trait.Delegate.html#method.on_ready
//! [`HciEvent`]: enum.HciEvent.html
//! [`AclEvent`]: enum.AclEvent.html
//! [`Commander`]: struct.Commander.html

mod cmd;
mod event;

use crate::bytes::*;
use crate::l2cap::{signaling, Channel, ChannelRecord, ConnectionStore, DEFAULT_MTU};
use crate::ring::FrameRing;
use crate::utils::{DeviceClass, HexSlice};
use crate::Error;
use core::fmt;
use core::ops::{Deref, DerefMut};
use heapless::{FnvIndexMap, FnvIndexSet};

/// Capacity of the TX ring in bytes.
///
/// Sized for the worst-case burst: the 252-byte local-name command plus a handful of small
/// frames.
pub const TX_RING_BUF: usize = 1024;

/// Capacity of the RX ring in bytes.
pub const RX_RING_BUF: usize = 1024;

/// Name announced to peers that page us. Wii accessories never look at it.
const LOCAL_NAME: &[u8] = b"ESP32-BT-WIIP";

/// Class of device announced for this host.
const LOCAL_CLASS_OF_DEVICE: u32 = 0x040500;

/// The General Inquiry Access Code: discover everything in range.
const GENERAL_INQUIRY_LAP: u32 = 0x9E8B33;

/// Inquiry duration in 1.28 s units (0x10 = 20.48 s).
const INQUIRY_DURATION: u8 = 0x10;

/// DM1 packets only; Balance Board traffic is tiny.
const CONNECTION_PACKET_TYPE: u16 = 0x0008;

/// Disconnect reason reported to peers we tear down.
const REASON_REMOTE_TERMINATED: u8 = 0x15;

/// Rejection reason for inbound connections the application does not want.
const REJECT_UNACCEPTABLE: u8 = 0x0F;

/// Bound on concurrently pending connect and name requests.
const MAX_PENDING: usize = 4;

/// Bound on distinct devices remembered within one inquiry window.
const MAX_DISCOVERED: usize = 8;

/// A Bluetooth device address.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct BdAddr([u8; 6]);

impl BdAddr {
    /// Creates an address from 6 raw bytes, in the order they travel on the wire (LSB first).
    pub const fn new(bytes: [u8; 6]) -> Self {
        BdAddr(bytes)
    }

    /// Returns the raw bytes making up this address (LSB first).
    pub fn raw(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Debug for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Device addresses are usually displayed MSB first, so that the OUI acts as a prefix.
        for (i, b) in self.0.iter().rev().enumerate() {
            if i != 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl FromBytes<'_> for BdAddr {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(BdAddr(bytes.read_array()?))
    }
}

impl ToBytes for BdAddr {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.0)
    }
}

bitflags::bitflags! {
    /// Scan modes enabled on the controller.
    ///
    /// Inquiry scan makes the host discoverable; page scan makes it connectable.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ScanMode: u8 {
        const INQUIRY = 0b01;
        const PAGE = 0b10;
    }
}

/// A device discovered during an inquiry window.
///
/// The triple besides the address is needed verbatim for remote-name queries and connection
/// attempts, so consumers pass the whole record back into [`Commander::request_remote_name`] and
/// [`Commander::connect`].
///
/// [`Commander::request_remote_name`]: struct.Commander.html#method.request_remote_name
/// [`Commander::connect`]: struct.Commander.html#method.connect
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InquiryResult {
    pub bdaddr: BdAddr,
    /// Page scan repetition mode.
    pub psrm: u8,
    pub class_of_device: u32,
    pub clock_offset: u16,
}

/// An inbound connection attempt, offered to [`Delegate::accept_connection`].
///
/// [`Delegate::accept_connection`]: trait.Delegate.html#method.accept_connection
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub bdaddr: BdAddr,
    pub class_of_device: u32,
}

/// An inbound channel request, offered to [`Delegate::accept_channel`].
///
/// [`Delegate::accept_channel`]: trait.Delegate.html#method.accept_channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub handle: u16,
    pub source_cid: Channel,
    pub psm: u16,
}

/// Link-level events surfaced to the delegate.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum HciEvent<'a> {
    /// The inquiry window closed.
    InquiryComplete,

    /// A device answered the inquiry. Reported once per address per window.
    InquiryResult(InquiryResult),

    /// An ACL link is up. `accepted` is true when the peer initiated the connection.
    ConnectionEstablished {
        bdaddr: BdAddr,
        handle: u16,
        accepted: bool,
    },

    /// An ACL link could not be brought up; `reason` is the HCI status code.
    ConnectionFailed {
        bdaddr: BdAddr,
        handle: u16,
        reason: u8,
        accepted: bool,
    },

    /// An ACL link went down.
    Disconnected { handle: u16, reason: u8 },

    /// A remote-name query finished.
    ///
    /// The name borrows the RX frame and is only valid for the duration of the callback.
    RemoteName {
        inquiry: InquiryResult,
        name: &'a str,
    },
}

/// Channel-level events surfaced to the delegate.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum AclEvent<'a> {
    /// Both sides finished configuring; the channel is ready for data.
    Established {
        handle: u16,
        local_cid: Channel,
        psm: u16,
    },

    /// The peer refused the channel.
    ConnectionFailed {
        handle: u16,
        local_cid: Channel,
        psm: u16,
    },

    /// The channel is gone, either on the peer's or on our initiative.
    Disconnected { handle: u16, psm: u16 },

    /// Payload received on a data channel.
    ///
    /// The slice borrows the RX frame and is only valid for the duration of the callback; copy
    /// it if it has to outlive the event.
    Data {
        handle: u16,
        channel: Channel,
        data: &'a [u8],
    },
}

/// Interface to the Bluetooth controller driver.
///
/// The engine polls `has_send_credit` between frames and never hands over a packet the
/// controller has no buffer space for.
pub trait Transport {
    /// Returns whether the controller can accept another packet right now.
    fn has_send_credit(&mut self) -> bool;

    /// Hands one complete H4 frame to the controller.
    fn send_packet(&mut self, packet: &[u8]);
}

/// The capability the application hands to the engine to receive events.
///
/// Handlers get a [`Commander`] and may call back into the engine from inside the callback;
/// the engine holds no state across the invocation that would make this unsafe.
///
/// [`Commander`]: struct.Commander.html
pub trait Delegate {
    /// The initialization chain finished; discovery may start.
    fn on_ready(&mut self, _commander: &mut Commander) {}

    /// A link-level event.
    fn on_hci_event(&mut self, commander: &mut Commander, event: HciEvent<'_>);

    /// Decides whether an inbound connection is accepted. Default: refuse everything.
    fn accept_connection(&mut self, _request: &ConnectionRequest) -> bool {
        false
    }

    /// A channel-level event.
    fn on_acl_event(&mut self, commander: &mut Commander, event: AclEvent<'_>);

    /// Decides whether an inbound channel is accepted. Default: refuse everything.
    fn accept_channel(&mut self, _request: &ChannelRequest) -> bool {
        false
    }
}

/// The sending half of the engine.
///
/// This is what event handlers receive: everything needed to emit commands and data — the TX
/// ring, the channel records, the pairing state and the signaling counters — but not the RX side,
/// which is busy dispatching the current frame.
pub struct Commander {
    tx: FrameRing<TX_RING_BUF>,
    connections: ConnectionStore,
    bd_addr: Option<BdAddr>,
    ready: bool,
    /// Identifier for the next signaling request we originate. Wraps from 255 to 1; 0 is
    /// reserved.
    identifier: u8,
    /// Next CID to hand out. Never reused within a run.
    local_cid: u16,
    /// Addresses we sent CREATE_CONNECTION for and got no completion yet.
    pending_connects: FnvIndexSet<BdAddr, MAX_PENDING>,
    /// Inquiry records stashed until their remote-name query completes.
    name_requests: FnvIndexMap<BdAddr, InquiryResult, MAX_PENDING>,
    /// Addresses already reported in the current inquiry window.
    discovered: FnvIndexSet<BdAddr, MAX_DISCOVERED>,
}

impl Commander {
    fn new() -> Self {
        Commander {
            tx: FrameRing::new(),
            connections: ConnectionStore::new(),
            bd_addr: None,
            ready: false,
            identifier: 1,
            local_cid: Channel::FIRST_DYNAMIC.as_raw(),
            pending_connects: FnvIndexSet::new(),
            name_requests: FnvIndexMap::new(),
            discovered: FnvIndexSet::new(),
        }
    }

    /// The local device address, once READ_BD_ADDR has completed.
    pub fn bd_addr(&self) -> Option<BdAddr> {
        self.bd_addr
    }

    /// Whether the initialization chain has finished.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Starts an inquiry (device discovery) window.
    ///
    /// Only legal once the engine is ready; discovered devices arrive as
    /// [`HciEvent::InquiryResult`].
    ///
    /// [`HciEvent::InquiryResult`]: enum.HciEvent.html#variant.InquiryResult
    pub fn scan(&mut self) {
        if !self.ready {
            error!("cannot scan, controller not initialized");
            return;
        }
        cmd::inquiry(&mut self.tx, GENERAL_INQUIRY_LAP, INQUIRY_DURATION, 0x00);
    }

    /// Cancels a running inquiry before its duration elapses.
    pub fn cancel_scan(&mut self) {
        cmd::inquiry_cancel(&mut self.tx);
    }

    /// Asks a discovered device for its human-readable name.
    ///
    /// The answer arrives as [`HciEvent::RemoteName`] carrying the original inquiry record.
    ///
    /// [`HciEvent::RemoteName`]: enum.HciEvent.html#variant.RemoteName
    pub fn request_remote_name(&mut self, result: &InquiryResult) {
        if self.name_requests.insert(result.bdaddr, *result).is_err() {
            warn!("name request table full, ignoring {:?}", result.bdaddr);
            return;
        }
        cmd::remote_name_request(&mut self.tx, result.bdaddr, result.psrm, result.clock_offset);
    }

    /// Initiates an ACL connection to a discovered device.
    ///
    /// The outcome arrives as [`HciEvent::ConnectionEstablished`] or
    /// [`HciEvent::ConnectionFailed`] with `accepted` set to `false`.
    ///
    /// [`HciEvent::ConnectionEstablished`]: enum.HciEvent.html#variant.ConnectionEstablished
    /// [`HciEvent::ConnectionFailed`]: enum.HciEvent.html#variant.ConnectionFailed
    pub fn connect(&mut self, result: &InquiryResult) {
        if self.pending_connects.insert(result.bdaddr).is_err() {
            warn!("pending connect set full, {:?} will look peer-initiated", result.bdaddr);
        }
        cmd::create_connection(
            &mut self.tx,
            result.bdaddr,
            CONNECTION_PACKET_TYPE,
            result.psrm,
            result.clock_offset,
            0x00, // no role switch
        );
    }

    /// Requests authentication on an established link, triggering the PIN exchange.
    pub fn auth(&mut self, handle: u16) {
        cmd::authentication_requested(&mut self.tx, handle);
    }

    /// Tears down an ACL link.
    pub fn disconnect(&mut self, handle: u16) {
        cmd::disconnect(&mut self.tx, handle, REASON_REMOTE_TERMINATED);
    }

    /// Opens an L2CAP channel for `psm` on an established link.
    ///
    /// The outcome arrives as [`AclEvent::Established`] or [`AclEvent::ConnectionFailed`].
    ///
    /// [`AclEvent::Established`]: enum.AclEvent.html#variant.Established
    /// [`AclEvent::ConnectionFailed`]: enum.AclEvent.html#variant.ConnectionFailed
    pub fn l2cap_connect(&mut self, handle: u16, psm: u16, mtu: u16) {
        let source_cid = self.alloc_cid();
        let frame = signaling::Frame {
            identifier: self.next_identifier(),
            pdu: signaling::Pdu::ConnectionRequest { psm, source_cid },
        };
        cmd::signaling_frame(&mut self.tx, handle, &frame);

        let record = ChannelRecord {
            handle,
            local_cid: source_cid,
            psm,
            remote_cid: Channel::NULL,
            mtu,
            local_configured: false,
            remote_configured: false,
        };
        if self.connections.emplace(record).is_err() {
            error!("connection store full, channel for PSM {:#06x} is lost", psm);
        }
    }

    /// Starts tearing down the channel for `psm` on `handle`.
    pub fn l2cap_disconnect(&mut self, handle: u16, psm: u16) {
        let (remote_cid, local_cid) = match self.connections.find_psm(handle, psm) {
            Some(record) => (record.remote_cid, record.local_cid),
            None => return,
        };
        let frame = signaling::Frame {
            identifier: self.next_identifier(),
            pdu: signaling::Pdu::DisconnectRequest {
                destination_cid: remote_cid,
                source_cid: local_cid,
            },
        };
        cmd::signaling_frame(&mut self.tx, handle, &frame);
    }

    /// Returns whether any L2CAP channel is still tracked on `handle`.
    pub fn has_channels(&self, handle: u16) -> bool {
        self.connections.has_link(handle)
    }

    /// Sends payload bytes on the established channel for `psm`.
    pub fn l2cap_send(&mut self, handle: u16, psm: u16, payload: &[u8]) {
        let remote_cid = match self.connections.find_psm(handle, psm) {
            Some(record) => record.remote_cid,
            None => {
                error!("cannot send, no channel for PSM {:#06x} on {:#06x}", psm, handle);
                return;
            }
        };
        cmd::acl_data(&mut self.tx, handle, remote_cid, payload);
    }

    fn send_reset(&mut self) {
        cmd::reset(&mut self.tx);
    }

    fn next_identifier(&mut self) -> u8 {
        let id = self.identifier;
        self.identifier = if id == 0xFF { 1 } else { id + 1 };
        id
    }

    fn alloc_cid(&mut self) -> Channel {
        let cid = Channel::new(self.local_cid);
        self.local_cid = self.local_cid.wrapping_add(1);
        cid
    }
}

/// The Bluetooth engine.
///
/// Owns the two packet rings and all protocol state. Construction immediately queues the first
/// command of the initialization chain; the hosting loop then calls [`process`] forever and
/// [`receive`] for every packet the controller driver delivers.
///
/// `Host` derefs to [`Commander`], so all send operations are available on it directly.
///
/// [`process`]: #method.process
/// [`receive`]: #method.receive
/// [`Commander`]: struct.Commander.html
pub struct Host {
    rx: FrameRing<RX_RING_BUF>,
    commander: Commander,
}

impl Host {
    /// Creates the engine and starts the controller initialization chain.
    pub fn new() -> Self {
        let mut commander = Commander::new();
        commander.send_reset();
        Host {
            rx: FrameRing::new(),
            commander,
        }
    }

    /// Accepts one complete framed packet from the controller driver.
    ///
    /// The first byte must be the H4 packet type (`0x04` event or `0x02` ACL). The packet is
    /// copied into the RX ring and processed on a later [`process`] tick; when the ring is full
    /// the packet is dropped with a warning.
    ///
    /// [`process`]: #method.process
    pub fn receive(&mut self, packet: &[u8]) {
        match self.rx.allocate(packet.len()) {
            Some(mut lease) => {
                lease.copy_from_slice(packet);
                lease.commit();
            }
            None => warn!("RX ring full, dropping {} byte packet", packet.len()),
        }
    }

    /// Runs one engine tick.
    ///
    /// First drains queued TX frames into the controller until it runs out of buffer credit,
    /// then dispatches at most one received packet through the state machines. Dispatching may
    /// queue new TX frames; they go out on the next tick.
    pub fn process<T: Transport, D: Delegate>(&mut self, transport: &mut T, delegate: &mut D) {
        while transport.has_send_credit() {
            match self.commander.tx.read() {
                Some(frame) => {
                    trace!("TX> {:?}", HexSlice(&frame[..]));
                    transport.send_packet(&frame);
                }
                None => break,
            }
        }

        if let Some(packet) = self.rx.read() {
            trace!("RX> {:?}", HexSlice(&packet[..]));
            dispatch(&mut self.commander, delegate, &packet);
        }
    }

    /// Returns whether both rings are drained, ie. the next tick would do nothing.
    pub fn is_idle(&self) -> bool {
        self.rx.is_empty() && self.commander.tx.is_empty()
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Host {
    type Target = Commander;

    fn deref(&self) -> &Commander {
        &self.commander
    }
}

impl DerefMut for Host {
    fn deref_mut(&mut self) -> &mut Commander {
        &mut self.commander
    }
}

fn dispatch<D: Delegate>(commander: &mut Commander, delegate: &mut D, packet: &[u8]) {
    let mut bytes = ByteReader::new(packet);
    match bytes.read_u8() {
        Ok(cmd::H4_EVENT) => {
            if let Err(e) = hci_event(commander, delegate, &mut bytes) {
                error!("malformed HCI event ({:?}): {:?}", e, HexSlice(packet));
            }
        }
        Ok(cmd::H4_ACL) => {
            if let Err(e) = acl_packet(commander, delegate, &mut bytes) {
                error!("malformed ACL frame ({:?}): {:?}", e, HexSlice(packet));
            }
        }
        Ok(other) => error!("unsupported H4 packet type {:#04x}", other),
        Err(_) => error!("empty packet from controller"),
    }
}

fn hci_event<D: Delegate>(
    commander: &mut Commander,
    delegate: &mut D,
    bytes: &mut ByteReader<'_>,
) -> Result<(), Error> {
    let code = event::EventCode::from(bytes.read_u8()?);
    let param_len = usize::from(bytes.read_u8()?);
    let mut params = ByteReader::new(bytes.read_slice(param_len)?);

    match code {
        event::EventCode::CommandComplete => command_complete(commander, delegate, &mut params)?,
        event::EventCode::InquiryResult => {
            let count = params.read_u8()?;
            for _ in 0..count {
                let record = event::parse_inquiry_record(&mut params)?;
                match commander.discovered.insert(record.bdaddr) {
                    Ok(true) => delegate.on_hci_event(commander, HciEvent::InquiryResult(record)),
                    Ok(false) => {} // already reported in this window
                    Err(_) => warn!("inquiry dedup set full, dropping {:?}", record.bdaddr),
                }
            }
        }
        event::EventCode::InquiryComplete => {
            debug!("inquiry complete");
            commander.discovered.clear();
            delegate.on_hci_event(commander, HciEvent::InquiryComplete);
        }
        event::EventCode::ConnectionComplete => {
            let ev = event::ConnectionComplete::parse(&mut params)?;
            let accepted = !commander.pending_connects.contains(&ev.bdaddr);
            commander.pending_connects.remove(&ev.bdaddr);
            let event = if ev.status == 0x00 {
                HciEvent::ConnectionEstablished {
                    bdaddr: ev.bdaddr,
                    handle: ev.handle,
                    accepted,
                }
            } else {
                HciEvent::ConnectionFailed {
                    bdaddr: ev.bdaddr,
                    handle: ev.handle,
                    reason: ev.status,
                    accepted,
                }
            };
            delegate.on_hci_event(commander, event);
        }
        event::EventCode::ConnectionRequest => {
            let request = event::parse_connection_request(&mut params)?;
            debug!(
                "connection request from {:?}, class {:?}",
                request.bdaddr,
                DeviceClass(request.class_of_device)
            );
            if delegate.accept_connection(&request) {
                info!("accepting connection from {:?}", request.bdaddr);
                cmd::accept_connection(&mut commander.tx, request.bdaddr);
            } else {
                info!("rejecting connection from {:?}", request.bdaddr);
                cmd::reject_connection(&mut commander.tx, request.bdaddr, REJECT_UNACCEPTABLE);
            }
        }
        event::EventCode::DisconnectionComplete => {
            let ev = event::DisconnectionComplete::parse(&mut params)?;
            if ev.status == 0x00 {
                // The link is gone; channels that never saw a disconnect handshake go with it.
                while let Some(record) = commander.connections.remove_link(ev.handle) {
                    delegate.on_acl_event(
                        commander,
                        AclEvent::Disconnected {
                            handle: ev.handle,
                            psm: record.psm,
                        },
                    );
                }
                delegate.on_hci_event(
                    commander,
                    HciEvent::Disconnected {
                        handle: ev.handle,
                        reason: ev.reason,
                    },
                );
            }
        }
        event::EventCode::RemoteNameRequestComplete => {
            let ev = event::RemoteNameComplete::parse(&mut params)?;
            match commander.name_requests.remove(&ev.bdaddr) {
                Some(inquiry) => match core::str::from_utf8(ev.name) {
                    Ok(name) => {
                        delegate.on_hci_event(commander, HciEvent::RemoteName { inquiry, name })
                    }
                    Err(_) => warn!("remote name of {:?} is not valid UTF-8", ev.bdaddr),
                },
                None => warn!("unsolicited remote name for {:?}", ev.bdaddr),
            }
        }
        event::EventCode::PinCodeRequest => {
            let bdaddr = event::parse_bdaddr(&mut params)?;
            // The Wii pairing shortcut: the PIN is the host's own address with its display byte
            // order reversed, which is exactly the over-the-air order we store.
            match commander.bd_addr {
                Some(local) => {
                    info!("answering PIN request from {:?}", bdaddr);
                    cmd::pin_code_reply(&mut commander.tx, bdaddr, local.raw());
                }
                None => error!("PIN request from {:?} before the local address is known", bdaddr),
            }
        }
        event::EventCode::LinkKeyRequest => {
            let bdaddr = event::parse_bdaddr(&mut params)?;
            // No key store; force a fresh pairing instead.
            cmd::link_key_negative_reply(&mut commander.tx, bdaddr);
        }
        event::EventCode::Unknown(code) => trace!("ignoring HCI event {:#04x}", code),
    }
    Ok(())
}

fn command_complete<D: Delegate>(
    commander: &mut Commander,
    delegate: &mut D,
    params: &mut ByteReader<'_>,
) -> Result<(), Error> {
    let ev = event::CommandComplete::parse(params)?;
    if ev.status != 0x00 {
        // Any failure aborts the initialization chain; there is no retry.
        error!("command {:?} failed (status {:#04x})", ev.opcode, ev.status);
        return Ok(());
    }

    match ev.opcode {
        cmd::RESET => {
            cmd::read_bd_addr(&mut commander.tx);
        }
        cmd::READ_BD_ADDR => {
            let addr = BdAddr::from_bytes(&mut ByteReader::new(ev.parameters))?;
            debug!("local address {:?}", addr);
            commander.bd_addr = Some(addr);
            cmd::write_local_name(&mut commander.tx, LOCAL_NAME);
        }
        cmd::WRITE_LOCAL_NAME => {
            cmd::write_class_of_device(&mut commander.tx, LOCAL_CLASS_OF_DEVICE);
        }
        cmd::WRITE_CLASS_OF_DEVICE => {
            cmd::write_scan_enable(&mut commander.tx, ScanMode::INQUIRY | ScanMode::PAGE);
        }
        cmd::WRITE_SCAN_ENABLE => {
            commander.ready = true;
            delegate.on_ready(commander);
        }
        cmd::INQUIRY_CANCEL => debug!("inquiry canceled"),
        other => trace!("command complete for {:?}", other),
    }
    Ok(())
}

fn acl_packet<D: Delegate>(
    commander: &mut Commander,
    delegate: &mut D,
    bytes: &mut ByteReader<'_>,
) -> Result<(), Error> {
    let handle_flags = bytes.read_u16_le()?;
    let handle = handle_flags & 0x0FFF;
    let boundary = (handle_flags >> 12) & 0b11;
    let broadcast = handle_flags >> 14;
    let _acl_len = bytes.read_u16_le()?;

    if boundary != cmd::PB_FIRST {
        error!("unsupported packet boundary flag {:#04b}", boundary);
        return Ok(());
    }
    if broadcast != cmd::BF_POINT_TO_POINT {
        error!("unsupported broadcast flag {:#04b}", broadcast);
        return Ok(());
    }

    let payload_len = usize::from(bytes.read_u16_le()?);
    let channel = Channel::from_bytes(bytes)?;
    let payload = bytes.read_slice(payload_len)?;

    if channel == Channel::SIGNALING {
        signaling_packet(commander, delegate, handle, payload)
    } else {
        delegate.on_acl_event(
            commander,
            AclEvent::Data {
                handle,
                channel,
                data: payload,
            },
        );
        Ok(())
    }
}

fn signaling_packet<D: Delegate>(
    commander: &mut Commander,
    delegate: &mut D,
    handle: u16,
    pdu: &[u8],
) -> Result<(), Error> {
    let mut bytes = ByteReader::new(pdu);
    let header = signaling::Header::from_bytes(&mut bytes)?;

    match header.code {
        signaling::Code::ConnectionRequest => {
            let psm = bytes.read_u16_le()?;
            let source_cid = Channel::from_bytes(&mut bytes)?;
            let local_cid = commander.alloc_cid();

            let request = ChannelRequest {
                handle,
                source_cid,
                psm,
            };
            let mut accepted = delegate.accept_channel(&request);
            if accepted {
                let record = ChannelRecord {
                    handle,
                    local_cid,
                    psm,
                    remote_cid: source_cid,
                    mtu: DEFAULT_MTU,
                    local_configured: false,
                    remote_configured: false,
                };
                if commander.connections.emplace(record).is_err() {
                    warn!("connection store full, refusing PSM {:#06x}", psm);
                    accepted = false;
                }
            }

            let result = if accepted {
                signaling::RESULT_SUCCESS
            } else {
                signaling::RESULT_REFUSED
            };
            cmd::signaling_frame(
                &mut commander.tx,
                handle,
                &signaling::Frame {
                    identifier: header.identifier,
                    pdu: signaling::Pdu::ConnectionResponse {
                        destination_cid: local_cid,
                        source_cid,
                        result,
                    },
                },
            );
            if accepted {
                let frame = signaling::Frame {
                    identifier: commander.next_identifier(),
                    pdu: signaling::Pdu::ConfigureRequest {
                        destination_cid: source_cid,
                        mtu: DEFAULT_MTU,
                    },
                };
                cmd::signaling_frame(&mut commander.tx, handle, &frame);
            }
        }
        signaling::Code::ConnectionResponse => {
            let destination_cid = Channel::from_bytes(&mut bytes)?;
            let source_cid = Channel::from_bytes(&mut bytes)?;
            let result = bytes.read_u16_le()?;
            let _status = bytes.read_u16_le()?;

            let (mtu, psm) = match commander.connections.find_local(handle, source_cid) {
                Some(record) => {
                    if result == signaling::RESULT_SUCCESS {
                        record.remote_cid = destination_cid;
                    }
                    (record.mtu, record.psm)
                }
                None => {
                    warn!("connection response for unknown channel {:?}", source_cid);
                    return Ok(());
                }
            };

            if result == signaling::RESULT_SUCCESS {
                let frame = signaling::Frame {
                    identifier: commander.next_identifier(),
                    pdu: signaling::Pdu::ConfigureRequest {
                        destination_cid,
                        mtu,
                    },
                };
                cmd::signaling_frame(&mut commander.tx, handle, &frame);
            } else if result >= 0x0002 {
                commander.connections.remove(handle, source_cid);
                delegate.on_acl_event(
                    commander,
                    AclEvent::ConnectionFailed {
                        handle,
                        local_cid: source_cid,
                        psm,
                    },
                );
            }
            // RESULT_PENDING: keep waiting for the final response.
        }
        signaling::Code::ConfigureRequest => {
            if header.length != 8 {
                error!("unexpected configuration length {:#06x}", header.length);
                return Ok(());
            }
            let destination_cid = Channel::from_bytes(&mut bytes)?;
            let flags = bytes.read_u16_le()?;
            if flags != 0x0000 {
                error!("unsupported configuration flags {:#06x}", flags);
                return Ok(());
            }
            let option_type = bytes.read_u8()?;
            let option_len = bytes.read_u8()?;
            if option_type != signaling::OPTION_MTU || option_len != signaling::OPTION_MTU_LEN {
                error!(
                    "unsupported configuration option {:#04x} of {} bytes",
                    option_type, option_len
                );
                return Ok(());
            }
            let mtu = bytes.read_u16_le()?;

            let (remote_cid, local_cid, psm, established) =
                match commander.connections.find_local(handle, destination_cid) {
                    Some(record) => {
                        record.mtu = mtu;
                        let was_complete = record.local_configured && record.remote_configured;
                        record.remote_configured = true;
                        (
                            record.remote_cid,
                            record.local_cid,
                            record.psm,
                            !was_complete && record.local_configured,
                        )
                    }
                    None => {
                        warn!("configuration request for unknown channel {:?}", destination_cid);
                        return Ok(());
                    }
                };

            cmd::signaling_frame(
                &mut commander.tx,
                handle,
                &signaling::Frame {
                    identifier: header.identifier,
                    pdu: signaling::Pdu::ConfigureResponse {
                        source_cid: remote_cid,
                        mtu,
                    },
                },
            );
            if established {
                delegate.on_acl_event(
                    commander,
                    AclEvent::Established {
                        handle,
                        local_cid,
                        psm,
                    },
                );
            }
        }
        signaling::Code::ConfigureResponse => {
            let source_cid = Channel::from_bytes(&mut bytes)?;
            let (local_cid, psm, established) =
                match commander.connections.find_local(handle, source_cid) {
                    Some(record) => {
                        let was_complete = record.local_configured && record.remote_configured;
                        record.local_configured = true;
                        (
                            record.local_cid,
                            record.psm,
                            !was_complete && record.remote_configured,
                        )
                    }
                    None => {
                        warn!("configuration response for unknown channel {:?}", source_cid);
                        return Ok(());
                    }
                };
            if established {
                delegate.on_acl_event(
                    commander,
                    AclEvent::Established {
                        handle,
                        local_cid,
                        psm,
                    },
                );
            }
        }
        signaling::Code::DisconnectRequest => {
            let destination_cid = Channel::from_bytes(&mut bytes)?;
            let source_cid = Channel::from_bytes(&mut bytes)?;

            let (local_cid, remote_cid) =
                match commander.connections.find_local(handle, destination_cid) {
                    Some(record) => (record.local_cid, record.remote_cid),
                    None => {
                        warn!("disconnect request for unknown channel {:?}", destination_cid);
                        return Ok(());
                    }
                };
            if remote_cid != source_cid {
                debug!("disconnect request names {:?}, expected {:?}", source_cid, remote_cid);
                return Ok(());
            }

            debug!("sending disconnect response");
            cmd::signaling_frame(
                &mut commander.tx,
                handle,
                &signaling::Frame {
                    identifier: header.identifier,
                    pdu: signaling::Pdu::DisconnectResponse {
                        destination_cid: local_cid,
                        source_cid: remote_cid,
                    },
                },
            );
            if let Some(record) = commander.connections.remove(handle, local_cid) {
                delegate.on_acl_event(
                    commander,
                    AclEvent::Disconnected {
                        handle,
                        psm: record.psm,
                    },
                );
            }
        }
        signaling::Code::DisconnectResponse => {
            let _destination_cid = Channel::from_bytes(&mut bytes)?;
            let source_cid = Channel::from_bytes(&mut bytes)?;
            match commander.connections.remove(handle, source_cid) {
                Some(record) => delegate.on_acl_event(
                    commander,
                    AclEvent::Disconnected {
                        handle,
                        psm: record.psm,
                    },
                ),
                None => warn!("disconnect response for unknown channel {:?}", source_cid),
            }
        }
        signaling::Code::CommandReject | signaling::Code::Unknown(_) => {
            debug!("ignoring signaling PDU {:?}", header.code);
        }
    }
    Ok(())
}
