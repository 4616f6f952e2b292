//! The application facade: turns raw HCI/ACL event streams into Balance Board events.
//!
//! [`Wii`] implements the engine's [`Delegate`] trait and wires the whole pipeline together:
//! it filters inquiry results by class of device, verifies the remote name, connects and
//! authenticates, opens the two HID channels, and owns one [`BalanceBoard`] driver per
//! established board. The application only sees the condensed [`WiiEvent`] stream through the
//! [`Sink`] it supplies.
//!
//! ```no_run
//! use wobble::hci::{Host, Transport};
//! use wobble::wii::{Wii, WiiEvent};
//!
//! # struct Radio;
//! # impl Transport for Radio {
//! #     fn has_send_credit(&mut self) -> bool { true }
//! #     fn send_packet(&mut self, _packet: &[u8]) {}
//! # }
//! # fn wait_for_interrupt() {}
//! let mut host = Host::new();
//! let mut radio = Radio;
//! let mut wii = Wii::new(|event: WiiEvent| {
//!     // React to board connects, disconnects and sensor frames here.
//! });
//!
//! loop {
//!     host.process(&mut radio, &mut wii);
//!     if host.is_idle() {
//!         wait_for_interrupt();
//!     }
//! }
//! ```
//!
//! [`Wii`]: struct.Wii.html
//! [`Delegate`]: ../hci/trait.Delegate.html
//! [`BalanceBoard`]: struct.BalanceBoard.html
//! [`WiiEvent`]: enum.WiiEvent.html
//! [`Sink`]: trait.Sink.html

mod board;

pub use self::board::{BalanceBoard, BoardReading, Leds};

use crate::hci::{
    AclEvent, ChannelRequest, Commander, ConnectionRequest, Delegate, HciEvent, Host,
};
use crate::l2cap::{PSM_HID_CONTROL, PSM_HID_INTERRUPT};
use heapless::FnvIndexMap;

/// Class of device shared by the Wii Remote and its accessories, Balance Board included.
pub const WIIMOTE_CLASS_OF_DEVICE: u32 = 0x042500;

/// The remote name a Balance Board answers with.
pub const BALANCE_BOARD_NAME: &str = "Nintendo RVL-WBC-01";

/// MTU requested on the two HID channels.
const BOARD_MTU: u16 = 0x40;

/// Bound on simultaneously connected boards.
const MAX_BOARDS: usize = 4;

/// What the application observes.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum WiiEvent {
    /// Discovery started ([`Wii::sync`] was called).
    ///
    /// [`Wii::sync`]: struct.Wii.html#method.sync
    ScanStarted,

    /// The discovery window closed. Call [`Wii::sync`] again to keep looking.
    ///
    /// [`Wii::sync`]: struct.Wii.html#method.sync
    ScanStopped,

    /// A board finished connecting; its calibration dialog starts now.
    BoardConnected { handle: u16 },

    /// A board went away.
    BoardDisconnected { handle: u16 },

    /// A calibrated sensor frame.
    BoardData(BoardReading),
}

/// Receives the high-level event stream.
///
/// Implemented for closures, so `Wii::new(|event| ...)` works directly.
pub trait Sink {
    fn event(&mut self, event: WiiEvent);
}

impl<F: FnMut(WiiEvent)> Sink for F {
    fn event(&mut self, event: WiiEvent) {
        self(event)
    }
}

/// The facade: pairs Balance Boards and forwards their readings into a [`Sink`].
///
/// Pass it as the delegate to [`Host::process`].
///
/// [`Sink`]: trait.Sink.html
/// [`Host::process`]: ../hci/struct.Host.html#method.process
pub struct Wii<S: Sink> {
    sink: S,
    boards: FnvIndexMap<u16, BalanceBoard, MAX_BOARDS>,
}

impl<S: Sink> Wii<S> {
    pub fn new(sink: S) -> Self {
        Wii {
            sink,
            boards: FnvIndexMap::new(),
        }
    }

    /// Starts looking for boards.
    ///
    /// Boards in pairing mode (sync button, or a battery change) answer the inquiry; everything
    /// from discovery to [`WiiEvent::BoardConnected`] happens on its own from here.
    ///
    /// [`WiiEvent::BoardConnected`]: enum.WiiEvent.html#variant.BoardConnected
    pub fn sync(&mut self, host: &mut Host) {
        self.sink.event(WiiEvent::ScanStarted);
        host.scan();
    }

    /// The sink passed to [`new`].
    ///
    /// [`new`]: #method.new
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

impl<S: Sink> Delegate for Wii<S> {
    fn accept_connection(&mut self, request: &ConnectionRequest) -> bool {
        request.class_of_device == WIIMOTE_CLASS_OF_DEVICE
    }

    fn on_hci_event(&mut self, commander: &mut Commander, event: HciEvent<'_>) {
        match event {
            HciEvent::InquiryComplete => self.sink.event(WiiEvent::ScanStopped),
            HciEvent::InquiryResult(result) => {
                if result.class_of_device == WIIMOTE_CLASS_OF_DEVICE {
                    commander.request_remote_name(&result);
                }
            }
            HciEvent::RemoteName { inquiry, name } => {
                info!("found \"{}\" at {:?}", name, inquiry.bdaddr);
                if name == BALANCE_BOARD_NAME {
                    commander.connect(&inquiry);
                }
            }
            HciEvent::ConnectionEstablished {
                handle, accepted, ..
            } => {
                if accepted {
                    // An already paired board is connecting back to us; it will establish the
                    // HID channels itself.
                    return;
                }
                commander.auth(handle);
                commander.l2cap_connect(handle, PSM_HID_CONTROL, BOARD_MTU);
                commander.l2cap_connect(handle, PSM_HID_INTERRUPT, BOARD_MTU);
            }
            HciEvent::ConnectionFailed { bdaddr, reason, .. } => {
                error!("failed to connect {:?} (status {:#04x})", bdaddr, reason);
            }
            HciEvent::Disconnected { handle, .. } => {
                info!("link {:#06x} closed", handle);
            }
        }
    }

    fn accept_channel(&mut self, request: &ChannelRequest) -> bool {
        request.psm == PSM_HID_CONTROL || request.psm == PSM_HID_INTERRUPT
    }

    fn on_acl_event(&mut self, commander: &mut Commander, event: AclEvent<'_>) {
        match event {
            AclEvent::Established { handle, psm, .. } => {
                if psm != PSM_HID_INTERRUPT {
                    return;
                }
                let board = BalanceBoard::new(handle);
                board.set_leds(commander, Leds::LED1);
                if self.boards.insert(handle, board).is_err() {
                    warn!("board table full, ignoring {:#06x}", handle);
                    return;
                }
                self.sink.event(WiiEvent::BoardConnected { handle });
            }
            AclEvent::ConnectionFailed { handle, psm, .. } => {
                error!("channel for PSM {:#06x} on {:#06x} was refused", psm, handle);
            }
            AclEvent::Disconnected { handle, psm } => {
                if psm != PSM_HID_INTERRUPT {
                    return;
                }
                self.sink.event(WiiEvent::BoardDisconnected { handle });
                self.boards.remove(&handle);
                // The control channel does not announce the board going away; take it down
                // together with the link.
                commander.l2cap_disconnect(handle, PSM_HID_CONTROL);
                commander.disconnect(handle);
            }
            AclEvent::Data { handle, data, .. } => {
                if let Some(board) = self.boards.get_mut(&handle) {
                    if let Some(reading) = board.on_data(commander, data) {
                        self.sink.event(WiiEvent::BoardData(reading));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::Transport;
    use std::vec::Vec;

    const BOARD_ADDR: [u8; 6] = [0x55, 0x44, 0x33, 0x22, 0x11, 0x00];
    const HANDLE: u16 = 0x0041;

    struct Recorder {
        events: Vec<WiiEvent>,
    }

    impl Sink for Recorder {
        fn event(&mut self, event: WiiEvent) {
            self.events.push(event);
        }
    }

    struct Controller {
        sent: Vec<Vec<u8>>,
    }

    impl Transport for Controller {
        fn has_send_credit(&mut self) -> bool {
            true
        }

        fn send_packet(&mut self, packet: &[u8]) {
            self.sent.push(packet.to_vec());
        }
    }

    impl Controller {
        fn take(&mut self) -> Vec<Vec<u8>> {
            core::mem::take(&mut self.sent)
        }
    }

    struct Harness {
        host: Host,
        controller: Controller,
        wii: Wii<Recorder>,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                host: Host::new(),
                controller: Controller { sent: Vec::new() },
                wii: Wii::new(Recorder { events: Vec::new() }),
            }
        }

        fn drive(&mut self) {
            while !self.host.is_idle() {
                self.host.process(&mut self.controller, &mut self.wii);
            }
        }

        fn feed_event(&mut self, code: u8, params: &[u8]) {
            let mut frame = vec![0x04, code, params.len() as u8];
            frame.extend_from_slice(params);
            self.host.receive(&frame);
            self.drive();
        }

        fn feed_acl(&mut self, cid: u16, payload: &[u8]) {
            let mut frame = vec![0x02];
            frame.extend_from_slice(&(HANDLE | 0x2000).to_le_bytes()); // PB = 0b10
            frame.extend_from_slice(&(payload.len() as u16 + 4).to_le_bytes());
            frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            frame.extend_from_slice(&cid.to_le_bytes());
            frame.extend_from_slice(payload);
            self.host.receive(&frame);
            self.drive();
        }

        fn feed_command_complete(&mut self, opcode: u16, extra: &[u8]) {
            let mut params = vec![0x01];
            params.extend_from_slice(&opcode.to_le_bytes());
            params.push(0x00); // status
            params.extend_from_slice(extra);
            self.feed_event(0x0E, &params);
        }

        fn events(&self) -> &[WiiEvent] {
            &self.wii.sink().events
        }

        /// Runs the initialization chain to READY and discards the commands it produced.
        fn init(&mut self) {
            self.drive();
            self.feed_command_complete(0x0C03, &[]); // RESET
            self.feed_command_complete(0x1009, &[0x0F, 0x0E, 0x0D, 0x0C, 0x0B, 0x0A]);
            self.feed_command_complete(0x0C13, &[]); // WRITE_LOCAL_NAME
            self.feed_command_complete(0x0C24, &[]); // WRITE_CLASS_OF_DEVICE
            self.feed_command_complete(0x0C1A, &[]); // WRITE_SCAN_ENABLE
            self.controller.take();
        }

        /// Discovery: inquiry, one board answering, window closing.
        fn discover(&mut self) {
            self.wii.sync(&mut self.host);
            self.drive();

            let mut result = vec![0x01]; // one record
            result.extend_from_slice(&BOARD_ADDR);
            result.extend_from_slice(&[0x01, 0x00, 0x00]); // psrm, reserved
            result.extend_from_slice(&[0x04, 0x25, 0x00]); // class of device
            result.extend_from_slice(&[0x00, 0x00]); // clock offset
            self.feed_event(0x02, &result);
            self.feed_event(0x01, &[0x00]); // inquiry complete
        }

        /// Remote name answer matching a Balance Board.
        fn report_name(&mut self) {
            let mut params = vec![0x00];
            params.extend_from_slice(&BOARD_ADDR);
            params.extend_from_slice(b"Nintendo RVL-WBC-01\0");
            self.feed_event(0x07, &params);
        }

        /// Link coming up for our CREATE_CONNECTION, then the interrupt channel handshake.
        fn establish(&mut self) {
            let mut params = vec![0x00];
            params.extend_from_slice(&HANDLE.to_le_bytes());
            params.extend_from_slice(&BOARD_ADDR);
            params.extend_from_slice(&[0x01, 0x00]); // ACL, no encryption
            self.feed_event(0x03, &params);

            // Peer answers the interrupt channel request (our CID 0x0041, theirs 0x0050)...
            self.feed_acl(
                0x0001,
                &[0x03, 0x02, 0x08, 0x00, 0x50, 0x00, 0x41, 0x00, 0x00, 0x00, 0x00, 0x00],
            );
            // ...configures its side...
            self.feed_acl(
                0x0001,
                &[0x04, 0x01, 0x08, 0x00, 0x41, 0x00, 0x00, 0x00, 0x01, 0x02, 0xB9, 0x00],
            );
            // ...and acknowledges our configuration.
            self.feed_acl(0x0001, &[0x05, 0x03, 0x06, 0x00, 0x41, 0x00, 0x00, 0x00]);
        }

        /// The full setup dialog of the board, ending with armed data reports.
        fn calibrate(&mut self) {
            self.feed_acl(0x0041, &[0xA1, 0x20, 0x00, 0x00, 0x02, 0x00]);
            self.feed_acl(0x0041, &[0xA1, 0x22, 0x00, 0x00, 0x16, 0x00]);
            self.feed_acl(0x0041, &[0xA1, 0x22, 0x00, 0x00, 0x16, 0x00]);
            self.feed_acl(
                0x0041,
                &[0xA1, 0x21, 0x00, 0x00, 0x50, 0x00, 0xFA, 0x00, 0x00, 0xA4, 0x20, 0x04, 0x02],
            );

            let mut low = vec![0xA1, 0x21, 0x00, 0x00, 0xF0, 0x00, 0x24];
            for _ in 0..4 {
                low.extend_from_slice(&10_000_u16.to_be_bytes());
            }
            for _ in 0..4 {
                low.extend_from_slice(&15_000_u16.to_be_bytes());
            }
            self.feed_acl(0x0041, &low);

            let mut high = vec![0xA1, 0x21, 0x00, 0x00, 0x70, 0x00, 0x34];
            for _ in 0..4 {
                high.extend_from_slice(&20_000_u16.to_be_bytes());
            }
            self.feed_acl(0x0041, &high);

            self.feed_acl(0x0041, &[0xA1, 0x21, 0x00, 0x00, 0x10, 0x00, 0x60, 20, 0]);
        }
    }

    fn command_opcode(frame: &[u8]) -> Option<u16> {
        if frame[0] == 0x01 {
            Some(u16::from_le_bytes([frame[1], frame[2]]))
        } else {
            None
        }
    }

    /// Splits an outbound ACL frame into (CID, L2CAP payload).
    fn acl_payload(frame: &[u8]) -> Option<(u16, &[u8])> {
        if frame[0] != 0x02 {
            return None;
        }
        assert_eq!(u16::from_le_bytes([frame[1], frame[2]]), HANDLE | 0x2000);
        let cid = u16::from_le_bytes([frame[7], frame[8]]);
        Some((cid, &frame[9..]))
    }

    #[test]
    fn discovery_requests_the_name_of_wiimote_class_devices() {
        let mut h = Harness::new();
        h.init();
        h.discover();

        let sent = h.controller.take();
        assert_eq!(command_opcode(&sent[0]), Some(0x0401)); // INQUIRY
        assert_eq!(&sent[0][4..], &[0x33, 0x8B, 0x9E, 0x10, 0x00]);
        assert_eq!(command_opcode(&sent[1]), Some(0x0419)); // REMOTE_NAME_REQUEST
        assert_eq!(&sent[1][4..10], &BOARD_ADDR);
        assert_eq!(&sent[1][10..], &[0x01, 0x00, 0x00, 0x00]);

        assert_eq!(h.events(), &[WiiEvent::ScanStarted, WiiEvent::ScanStopped]);
    }

    #[test]
    fn matching_name_triggers_a_connection() {
        let mut h = Harness::new();
        h.init();
        h.discover();
        h.controller.take();

        h.report_name();
        let sent = h.controller.take();
        assert_eq!(command_opcode(&sent[0]), Some(0x0405)); // CREATE_CONNECTION
        assert_eq!(&sent[0][4..10], &BOARD_ADDR);
    }

    #[test]
    fn non_matching_name_is_ignored() {
        let mut h = Harness::new();
        h.init();
        h.discover();
        h.controller.take();

        let mut params = vec![0x00];
        params.extend_from_slice(&BOARD_ADDR);
        params.extend_from_slice(b"Nintendo RVL-CNT-01\0");
        h.feed_event(0x07, &params);
        assert!(h.controller.take().is_empty());
    }

    #[test]
    fn connection_establishes_both_hid_channels() {
        let mut h = Harness::new();
        h.init();
        h.discover();
        h.report_name();
        h.controller.take();

        h.establish();
        let sent = h.controller.take();

        assert_eq!(command_opcode(&sent[0]), Some(0x0411)); // AUTHENTICATION_REQUESTED
        assert_eq!(&sent[0][4..], &[0x41, 0x00]);

        // Channel requests for HID control (CID 0x0040) and HID interrupt (CID 0x0041).
        let (cid, control) = acl_payload(&sent[1]).unwrap();
        assert_eq!(cid, 0x0001);
        assert_eq!(control, &[0x02, 0x01, 0x04, 0x00, 0x11, 0x00, 0x40, 0x00]);
        let (_, interrupt) = acl_payload(&sent[2]).unwrap();
        assert_eq!(interrupt, &[0x02, 0x02, 0x04, 0x00, 0x13, 0x00, 0x41, 0x00]);

        // Our configuration request for the interrupt channel, MTU 0x40.
        let (_, configure) = acl_payload(&sent[3]).unwrap();
        assert_eq!(configure, &[0x04, 0x03, 0x08, 0x00, 0x50, 0x00, 0x00, 0x00, 0x01, 0x02, 0x40, 0x00]);

        // The response to the peer's configuration request echoes its MTU.
        let (_, response) = acl_payload(&sent[4]).unwrap();
        assert_eq!(
            response,
            &[0x05, 0x01, 0x0A, 0x00, 0x50, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0xB9, 0x00]
        );

        // Once both sides are configured, the board exists and LED 1 is lit.
        let (cid, leds) = acl_payload(&sent[5]).unwrap();
        assert_eq!(cid, 0x0050);
        assert_eq!(leds, &[0xA2, 0x11, 0x10]);

        let connected: Vec<_> = h
            .events()
            .iter()
            .filter(|e| matches!(e, WiiEvent::BoardConnected { .. }))
            .collect();
        assert_eq!(connected, &[&WiiEvent::BoardConnected { handle: HANDLE }]);
    }

    #[test]
    fn calibration_dialog_and_first_reading() {
        let mut h = Harness::new();
        h.init();
        h.discover();
        h.report_name();
        h.establish();
        h.controller.take();

        h.calibrate();
        let sent = h.controller.take();
        let payloads: Vec<_> = sent.iter().map(|f| acl_payload(f).unwrap()).collect();

        // Unlock the extension...
        assert_eq!(
            &payloads[0].1[..8],
            &[0xA2, 0x16, 0x04, 0xA4, 0x00, 0xF0, 0x01, 0x55]
        );
        assert_eq!(
            &payloads[1].1[..8],
            &[0xA2, 0x16, 0x04, 0xA4, 0x00, 0xFB, 0x01, 0x00]
        );
        // ...identify it...
        assert_eq!(payloads[2].1, &[0xA2, 0x17, 0x04, 0xA4, 0x00, 0xFA, 0x00, 0x06]);
        // ...fetch both calibration blocks and the reference temperature...
        assert_eq!(payloads[3].1, &[0xA2, 0x17, 0x04, 0xA4, 0x00, 0x24, 0x00, 0x10]);
        assert_eq!(payloads[4].1, &[0xA2, 0x17, 0x04, 0xA4, 0x00, 0x34, 0x00, 0x08]);
        assert_eq!(payloads[5].1, &[0xA2, 0x17, 0x04, 0xA4, 0x00, 0x60, 0x00, 0x02]);
        // ...and arm the data reports.
        assert_eq!(payloads[6].1, &[0xA2, 0x12, 0x00, 0x34]);

        // A data report converts to calibrated weights.
        let mut report = vec![0xA1, 0x34, 0x00, 0x00];
        for _ in 0..4 {
            report.extend_from_slice(&15_000_u16.to_be_bytes());
        }
        report.extend_from_slice(&[20, 0x00, 200]);
        h.feed_acl(0x0041, &report);

        assert_eq!(
            h.events().last(),
            Some(&WiiEvent::BoardData(BoardReading {
                tr: 17_000,
                br: 17_000,
                tl: 17_000,
                bl: 17_000,
                temperature: 20,
                reference_temperature: 20,
                battery_level: 200,
            }))
        );
    }

    #[test]
    fn no_reading_before_the_dialog_finishes() {
        let mut h = Harness::new();
        h.init();
        h.discover();
        h.report_name();
        h.establish();
        h.controller.take();

        let mut report = vec![0xA1, 0x34, 0x00, 0x00];
        for _ in 0..4 {
            report.extend_from_slice(&15_000_u16.to_be_bytes());
        }
        report.extend_from_slice(&[20, 0x00, 200]);
        h.feed_acl(0x0041, &report);

        assert!(h
            .events()
            .iter()
            .all(|e| !matches!(e, WiiEvent::BoardData(_))));
    }

    #[test]
    fn peer_disconnect_tears_the_board_down() {
        let mut h = Harness::new();
        h.init();
        h.discover();
        h.report_name();
        h.establish();
        h.calibrate();
        h.controller.take();

        h.feed_acl(0x0001, &[0x06, 0x09, 0x04, 0x00, 0x41, 0x00, 0x50, 0x00]);
        let sent = h.controller.take();

        let (cid, response) = acl_payload(&sent[0]).unwrap();
        assert_eq!(cid, 0x0001);
        assert_eq!(response, &[0x07, 0x09, 0x04, 0x00, 0x41, 0x00, 0x50, 0x00]);
        // The control channel is torn down right behind the interrupt channel.
        let (cid, control) = acl_payload(&sent[1]).unwrap();
        assert_eq!(cid, 0x0001);
        assert_eq!(control, &[0x06, 0x04, 0x04, 0x00, 0x00, 0x00, 0x40, 0x00]);
        assert_eq!(command_opcode(&sent[2]), Some(0x0406)); // DISCONNECT
        assert_eq!(&sent[2][4..], &[0x41, 0x00, 0x15]);

        assert_eq!(
            h.events().last(),
            Some(&WiiEvent::BoardDisconnected { handle: HANDLE })
        );

        // Once the peer confirms the control channel, no record for the link remains.
        h.feed_acl(0x0001, &[0x07, 0x04, 0x04, 0x00, 0x00, 0x00, 0x40, 0x00]);
        assert!(h.controller.take().is_empty());
        assert!(!h.host.has_channels(HANDLE));

        // A duplicate disconnect for the same channel finds nothing to remove.
        h.feed_acl(0x0001, &[0x06, 0x0A, 0x04, 0x00, 0x41, 0x00, 0x50, 0x00]);
        assert!(h.controller.take().is_empty());
        assert_eq!(
            h.events().last(),
            Some(&WiiEvent::BoardDisconnected { handle: HANDLE })
        );
        let disconnects = h
            .events()
            .iter()
            .filter(|e| matches!(e, WiiEvent::BoardDisconnected { .. }))
            .count();
        assert_eq!(disconnects, 1);
    }
}
