//! The Balance Board driver.
//!
//! A freshly connected board streams nothing useful: its weight sensors sit behind an extension
//! controller that boots encrypted and uncalibrated. The driver walks a fixed setup dialog over
//! the HID interrupt channel before arming the data reports:
//!
//! 1. Wait for a status report announcing the extension, then unlock it (two register writes).
//! 2. Read the extension identifier and verify it is a Balance Board.
//! 3. Read the calibration tables: per sensor one reference value each at 0 kg, 17 kg and 34 kg.
//! 4. Read the reference temperature and switch the board into report mode `0x34`.
//!
//! Every step sends one Wiimote HID command and advances when the matching status/ack/read
//! response arrives; a failed ack falls back to the start of the dialog. Once the reference
//! temperature is known, incoming `0x34` reports are converted into [`BoardReading`]s by
//! interpolating each raw strain value against the three calibration points of its sensor.
//!
//! [`BoardReading`]: struct.BoardReading.html

use crate::hci::Commander;
use crate::l2cap::PSM_HID_INTERRUPT;

/// HID output report prefix (host to device).
const OUTPUT_PREFIX: u8 = 0xA2;

/// HID input report prefix (device to host).
const INPUT_PREFIX: u8 = 0xA1;

/// Output report: front LED mask.
const REPORT_LEDS: u8 = 0x11;

/// Output report: select the data reporting mode.
const REPORT_MODE: u8 = 0x12;

/// Output report: write device memory or registers.
const REPORT_WRITE: u8 = 0x16;

/// Output report: read device memory or registers.
const REPORT_READ: u8 = 0x17;

/// Input report: status, sent after connection and on extension changes.
const REPORT_STATUS: u8 = 0x20;

/// Input report: data returned by a read.
const REPORT_READ_DATA: u8 = 0x21;

/// Input report: acknowledgement of an output report.
const REPORT_ACK: u8 = 0x22;

/// Input report: extension data, the only mode the Balance Board supports.
const REPORT_DATA: u8 = 0x34;

/// Address space selector for extension registers.
const SPACE_REGISTERS: u8 = 0x04;

/// Writing 0x55 here is the first half of the unencrypted-extension handshake.
const REG_EXTENSION_INIT1: u32 = 0xA400F0;

/// Writing 0x00 here completes the handshake; extension bytes arrive unencrypted afterwards.
const REG_EXTENSION_INIT2: u32 = 0xA400FB;

/// Six identifier bytes naming the attached extension.
const REG_EXTENSION_ID: u32 = 0xA400FA;

/// Calibration block: four sensors at 0 kg, then four at 17 kg.
const REG_CALIBRATION_LOW: u32 = 0xA40024;

/// Calibration block: four sensors at 34 kg.
const REG_CALIBRATION_HIGH: u32 = 0xA40034;

/// Temperature at which the board was calibrated.
const REG_REFERENCE_TEMP: u32 = 0xA40060;

/// Read response carrying the extension identifier of a Balance Board.
const BALANCE_BOARD_ID: [u8; 8] = [0x00, 0xFA, 0x00, 0x00, 0xA4, 0x20, 0x04, 0x02];

bitflags::bitflags! {
    /// The four player LEDs on the front of the board.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Leds: u8 {
        const LED1 = 0b0001;
        const LED2 = 0b0010;
        const LED3 = 0b0100;
        const LED4 = 0b1000;
    }
}

/// Where the setup dialog currently stands.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SetupStep {
    /// Waiting for a status report with the extension bit set.
    AwaitExtensionStatus,
    /// Waiting for the ack of the first unlock write.
    AwaitFirstInitAck,
    /// Waiting for the ack of the second unlock write.
    AwaitSecondInitAck,
    /// Waiting for the extension identifier.
    AwaitExtensionId,
    /// Waiting for the 0 kg / 17 kg calibration block.
    AwaitLowCalibration,
    /// Waiting for the 34 kg calibration block.
    AwaitHighCalibration,
    /// Waiting for the reference temperature.
    AwaitReferenceTemperature,
}

/// One calibrated sensor frame.
///
/// The four weights are in thousandths of a kilogram per sensor; temperature and battery level
/// are reported verbatim from the board.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BoardReading {
    /// Top right sensor.
    pub tr: u16,
    /// Bottom right sensor.
    pub br: u16,
    /// Top left sensor.
    pub tl: u16,
    /// Bottom left sensor.
    pub bl: u16,
    pub temperature: u8,
    pub reference_temperature: u8,
    pub battery_level: u8,
}

impl BoardReading {
    /// Sum of all four sensors, in thousandths of a kilogram.
    pub fn total(&self) -> u32 {
        u32::from(self.tr) + u32::from(self.br) + u32::from(self.tl) + u32::from(self.bl)
    }

    /// Total weight with the first-order temperature drift model applied.
    pub fn temperature_compensated_total(&self) -> f32 {
        let drift =
            1.0 - 0.0007 * (f32::from(self.temperature) - f32::from(self.reference_temperature));
        0.999 * self.total() as f32 * drift
    }
}

/// Per-board protocol state: the setup dialog and the calibration tables.
pub struct BalanceBoard {
    handle: u16,
    step: SetupStep,
    /// Reference values per sensor: indices 0..4 at 0 kg, 4..8 at 17 kg, 8..12 at 34 kg.
    calibration: [u16; 12],
    /// Zero until the dialog has completed; data reports are ignored before that.
    reference_temperature: u8,
}

impl BalanceBoard {
    /// Creates the driver for a board whose HID interrupt channel is established on `handle`.
    pub fn new(handle: u16) -> Self {
        BalanceBoard {
            handle,
            step: SetupStep::AwaitExtensionStatus,
            calibration: [0; 12],
            reference_temperature: 0,
        }
    }

    /// The ACL link this board is connected through.
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// Lights up the given front LEDs and turns the others off.
    pub fn set_leds(&self, commander: &mut Commander, leds: Leds) {
        let frame = [OUTPUT_PREFIX, REPORT_LEDS, leds.bits() << 4];
        commander.l2cap_send(self.handle, PSM_HID_INTERRUPT, &frame);
    }

    /// Selects the input report the board should send, continuously or on change only.
    pub fn set_reporting_mode(&self, commander: &mut Commander, mode: u8, continuous: bool) {
        let frame = [
            OUTPUT_PREFIX,
            REPORT_MODE,
            if continuous { 0x04 } else { 0x00 },
            mode,
        ];
        commander.l2cap_send(self.handle, PSM_HID_INTERRUPT, &frame);
    }

    /// Handles one HID interrupt payload from the board.
    ///
    /// Returns a reading when the payload was a data report and the board is calibrated;
    /// everything else feeds the setup dialog.
    pub fn on_data(&mut self, commander: &mut Commander, data: &[u8]) -> Option<BoardReading> {
        if data.first() != Some(&INPUT_PREFIX) {
            return None;
        }
        // A non-zero reference temperature means calibration has finished.
        if data.get(1) == Some(&REPORT_DATA) && self.reference_temperature != 0 {
            self.parse_reading(data)
        } else {
            self.advance_setup(commander, data);
            None
        }
    }

    fn parse_reading(&self, data: &[u8]) -> Option<BoardReading> {
        let mem = data.get(4..15)?;
        let raw_tr = u16::from_be_bytes([mem[0], mem[1]]);
        let raw_br = u16::from_be_bytes([mem[2], mem[3]]);
        let raw_tl = u16::from_be_bytes([mem[4], mem[5]]);
        let raw_bl = u16::from_be_bytes([mem[6], mem[7]]);

        Some(BoardReading {
            tr: self.interpolate(0, raw_tr),
            br: self.interpolate(1, raw_br),
            tl: self.interpolate(2, raw_tl),
            bl: self.interpolate(3, raw_bl),
            temperature: mem[8],
            reference_temperature: self.reference_temperature,
            battery_level: mem[10],
        })
    }

    fn advance_setup(&mut self, commander: &mut Commander, data: &[u8]) {
        match self.step {
            SetupStep::AwaitExtensionStatus => {
                let extension = data.get(4).map_or(false, |flags| flags & 0x02 != 0);
                if data.get(1) == Some(&REPORT_STATUS) && extension {
                    self.write_register(commander, REG_EXTENSION_INIT1, &[0x55]);
                    self.step = SetupStep::AwaitFirstInitAck;
                }
            }
            SetupStep::AwaitFirstInitAck => {
                if is_write_ack(data) {
                    if ack_ok(data) {
                        self.write_register(commander, REG_EXTENSION_INIT2, &[0x00]);
                        self.step = SetupStep::AwaitSecondInitAck;
                    } else {
                        self.step = SetupStep::AwaitExtensionStatus;
                    }
                }
            }
            SetupStep::AwaitSecondInitAck => {
                if is_write_ack(data) {
                    if ack_ok(data) {
                        self.read_register(commander, REG_EXTENSION_ID, 6);
                        self.step = SetupStep::AwaitExtensionId;
                    } else {
                        self.step = SetupStep::AwaitExtensionStatus;
                    }
                }
            }
            SetupStep::AwaitExtensionId => {
                if data.get(1) == Some(&REPORT_READ_DATA) {
                    if data.get(5..13).map_or(false, |id| id == BALANCE_BOARD_ID) {
                        self.read_register(commander, REG_CALIBRATION_LOW, 16);
                        self.step = SetupStep::AwaitLowCalibration;
                    } else {
                        warn!("attached extension is not a balance board");
                        self.step = SetupStep::AwaitExtensionStatus;
                    }
                }
            }
            SetupStep::AwaitLowCalibration => {
                if data.get(1) == Some(&REPORT_READ_DATA) {
                    if let Some(mem) = data.get(7..23) {
                        for (slot, pair) in
                            self.calibration[..8].iter_mut().zip(mem.chunks_exact(2))
                        {
                            *slot = u16::from_be_bytes([pair[0], pair[1]]);
                        }
                        self.read_register(commander, REG_CALIBRATION_HIGH, 8);
                        self.step = SetupStep::AwaitHighCalibration;
                    } else {
                        warn!("short calibration read");
                    }
                }
            }
            SetupStep::AwaitHighCalibration => {
                if data.get(1) == Some(&REPORT_READ_DATA) {
                    if let Some(mem) = data.get(7..15) {
                        for (slot, pair) in
                            self.calibration[8..].iter_mut().zip(mem.chunks_exact(2))
                        {
                            *slot = u16::from_be_bytes([pair[0], pair[1]]);
                        }
                        self.read_register(commander, REG_REFERENCE_TEMP, 2);
                        self.step = SetupStep::AwaitReferenceTemperature;
                    } else {
                        warn!("short calibration read");
                    }
                }
            }
            SetupStep::AwaitReferenceTemperature => {
                if data.get(1) == Some(&REPORT_READ_DATA) {
                    if let Some(&temperature) = data.get(7) {
                        self.reference_temperature = temperature;
                        self.set_reporting_mode(commander, REPORT_DATA, false);
                        self.step = SetupStep::AwaitExtensionStatus;
                        info!("balance board calibrated, reference temperature {}", temperature);
                    } else {
                        warn!("short temperature read");
                    }
                }
            }
        }
    }

    fn write_register(&self, commander: &mut Commander, offset: u32, data: &[u8]) {
        debug_assert!(data.len() <= 16);
        let mut frame = [0; 23];
        frame[0] = OUTPUT_PREFIX;
        frame[1] = REPORT_WRITE;
        frame[2] = SPACE_REGISTERS;
        frame[3..6].copy_from_slice(&offset.to_be_bytes()[1..]);
        frame[6] = data.len() as u8;
        frame[7..7 + data.len()].copy_from_slice(data);
        commander.l2cap_send(self.handle, PSM_HID_INTERRUPT, &frame);
    }

    fn read_register(&self, commander: &mut Commander, offset: u32, len: u16) {
        let mut frame = [0; 8];
        frame[0] = OUTPUT_PREFIX;
        frame[1] = REPORT_READ;
        frame[2] = SPACE_REGISTERS;
        frame[3..6].copy_from_slice(&offset.to_be_bytes()[1..]);
        frame[6..8].copy_from_slice(&len.to_be_bytes());
        commander.l2cap_send(self.handle, PSM_HID_INTERRUPT, &frame);
    }

    /// Maps one raw strain value to thousandths of a kilogram.
    ///
    /// Piecewise linear between the three calibration points of the sensor; 0 below the 0 kg
    /// point, extrapolating (saturating) above the 34 kg point.
    fn interpolate(&self, sensor: usize, raw: u16) -> u16 {
        let zero = self.calibration[sensor];
        let mid = self.calibration[sensor + 4];
        let top = self.calibration[sensor + 8];

        if raw < zero {
            0
        } else if raw < mid {
            segment(raw - zero, mid - zero)
        } else {
            17_000_u16.saturating_add(segment(raw - mid, top - mid))
        }
    }
}

/// Maps `num` out of `den` raw units onto a 17 kg span, rounding half up.
fn segment(num: u16, den: u16) -> u16 {
    if den == 0 {
        return 0;
    }
    let scaled = u32::from(num) * 17_000 + u32::from(den) / 2;
    (scaled / u32::from(den)).min(u32::from(u16::MAX)) as u16
}

fn is_write_ack(data: &[u8]) -> bool {
    data.get(1) == Some(&REPORT_ACK) && data.get(4) == Some(&REPORT_WRITE)
}

fn ack_ok(data: &[u8]) -> bool {
    data.get(5) == Some(&0x00)
}
