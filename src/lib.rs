//! A host-side Bluetooth Classic (BR/EDR) stack slice for Nintendo Wii accessories.
//!
//! Wobble sits directly on top of a Host Controller Interface (HCI) transport: it formats HCI
//! commands and ACL frames outbound, parses HCI events and ACL frames inbound, and drives two
//! protocol state machines — HCI link setup/pairing and L2CAP channel management — to deliver a
//! small high-level event stream (scan started/stopped, board connected/disconnected, sensor
//! frame) to the application.
//!
//! # Using the stack
//!
//! Wobble is runtime and hardware-agnostic: It does not need an RTOS (although you can certainly
//! use one if you want) and talks to the Bluetooth controller through two narrow interfaces that
//! need to be implemented once for every supported radio:
//! * A [`Transport`] that forwards complete H4 frames to the controller and reports its buffer
//!   credit.
//! * A call to [`Host::receive`] for every framed packet the controller sends back.
//!
//! Everything else is driven from a single cooperative [`Host::process`] tick. The [`wii`] module
//! contains the application facade that turns the raw HCI/ACL event streams into Balance Board
//! events.
//!
//! [`Transport`]: hci/trait.Transport.html
//! [`Host::receive`]: hci/struct.Host.html#method.receive
//! [`Host::process`]: hci/struct.Host.html#method.process
//! [`wii`]: wii/index.html

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod bytes;
mod error;
pub mod hci;
pub mod l2cap;
pub mod ring;
pub mod wii;

pub use self::error::Error;
