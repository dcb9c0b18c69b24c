//! User-space USB device emulation.
//!
//! A virtual host controller exposes one event channel per hub port; a
//! user-space emulator attached to a channel plays the device role: it
//! answers control requests, serves descriptors, sources interrupt/bulk/iso
//! data and honors cancellation. The controller speaks USB to the host
//! stack's hub/URB surface, and the framed wire protocol of
//! [`vhci_protocol`] to the emulator.
//!
//! The crate contains both sides:
//!
//! - [`hcd`] — the controller: per-port status word and state machine,
//!   ordered event queues with cancellation correlation, transfer records,
//!   the virtual root hub, and the per-port event channel.
//! - [`device`] — the emulator-side marshaller: typed URBs decoded from the
//!   wire, validated, and completed back.
//! - [`gadget`] — a reusable device model (endpoints, interfaces, alternate
//!   settings, configurations) that routes transfers to handler objects and
//!   implements the Chapter 9 state machine.
//! - [`filter`] — the standard-request dispatcher used by the gadget and
//!   available to hand-rolled emulators.
//! - [`descriptor`] and [`strings`] — descriptor serializers and string
//!   tables.

pub mod descriptor;
pub mod device;
mod error;
pub mod filter;
pub mod gadget;
pub mod hcd;
pub mod strings;
pub mod usb;

pub use error::{Error, Result};
pub use usb::{SetupPacket, UrbStatus};
