//! Per-port state: the 32-bit hub status word, reset/resume deadlines, and
//! the three ordered event queues (cancellations, signals, transfers) the
//! emulator drains through the port's channel.

use std::collections::VecDeque;
use std::time::Instant;

use bitflags::bitflags;
use tracing::debug;
use vhci_protocol::PortSignal;

use super::urb::{HostTransferStatus, HostUrb, TransferResult, UrbRecord};
use crate::hcd::GivebackUrb;

bitflags! {
    /// Standard hub port status, change bits in the upper half.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortStatus: u32 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVERCURRENT = 1 << 3;
        const RESET = 1 << 4;
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
        const C_CONNECTION = 1 << 16;
        const C_ENABLE = 1 << 17;
        const C_SUSPEND = 1 << 18;
        const C_OVERCURRENT = 1 << 19;
        const C_RESET = 1 << 20;
    }
}

impl PortStatus {
    /// All change bits; the host polls and clears these.
    pub const CHANGE_MASK: PortStatus = PortStatus::C_CONNECTION
        .union(PortStatus::C_ENABLE)
        .union(PortStatus::C_SUSPEND)
        .union(PortStatus::C_OVERCURRENT)
        .union(PortStatus::C_RESET);
}

/// `a` is later than `b` in sequence-number order, correct across 32-bit
/// wrap.
pub(crate) fn seq_after(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) < 0
}

pub(crate) fn seq_after_eq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

pub(crate) fn seq_before(a: u32, b: u32) -> bool {
    seq_after(b, a)
}

/// The next event a port would hand to its reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueuedEvent {
    /// Cancellation of an already-delivered transfer. Highest priority: the
    /// host has already freed its side and the emulator must unblock soon.
    Unlink { seq_num: u32 },
    /// Port-level electrical transition.
    Signal(PortSignal),
    /// The transfer at the delivery cursor.
    Transfer { seq_num: u32 },
}

pub(crate) struct Port {
    number: u8,
    status: PortStatus,
    old_status: PortStatus,
    enabled: bool,
    resuming: bool,
    hcd_suspended: bool,
    device_attached: bool,
    re_timeout: Option<Instant>,
    signals: VecDeque<PortSignal>,
    transfers: VecDeque<UrbRecord>,
    /// Sequence numbers of delivered transfers the host has cancelled, in
    /// cancellation order. Each entry is paired with the `unlink_queued`
    /// flag of its record.
    cancellations: VecDeque<u32>,
    /// Sequence number of the first transfer not yet delivered to the
    /// reader; `None` means every queued transfer has been delivered.
    cursor: Option<u32>,
    next_seq: u32,
    opened: bool,
}

impl Port {
    pub(crate) fn new(number: u8) -> Self {
        Port {
            number,
            status: PortStatus::empty(),
            old_status: PortStatus::empty(),
            enabled: false,
            resuming: false,
            hcd_suspended: false,
            device_attached: false,
            re_timeout: None,
            signals: VecDeque::new(),
            transfers: VecDeque::new(),
            cancellations: VecDeque::new(),
            cursor: None,
            // Close to the 32-bit boundary so ordinary tests exercise
            // sequence-number wrap.
            next_seq: 0xffff_ff00,
            opened: false,
        }
    }

    pub(crate) fn status(&self) -> PortStatus {
        self.status
    }

    pub(crate) fn status_word(&self) -> u32 {
        self.status.bits()
    }

    pub(crate) fn set_status_bits(&mut self, bits: PortStatus) {
        self.status |= bits;
    }

    pub(crate) fn clear_status_bits(&mut self, bits: PortStatus) {
        self.status -= bits;
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn is_resuming(&self) -> bool {
        self.resuming
    }

    pub(crate) fn set_resuming(&mut self, resuming: bool) {
        self.resuming = resuming;
    }

    pub(crate) fn is_device_attached(&self) -> bool {
        self.device_attached
    }

    pub(crate) fn set_device_attached(&mut self, attached: bool) {
        self.device_attached = attached;
    }

    pub(crate) fn set_hcd_suspended(&mut self, suspended: bool) {
        self.hcd_suspended = suspended;
    }

    pub(crate) fn set_re_timeout(&mut self, now: Instant, ms: u64) {
        self.re_timeout = Some(now + std::time::Duration::from_millis(ms));
    }

    pub(crate) fn re_timeout_elapsed(&self, now: Instant) -> bool {
        matches!(self.re_timeout, Some(deadline) if now >= deadline)
    }

    pub(crate) fn is_opened(&self) -> bool {
        self.opened
    }

    pub(crate) fn set_opened(&mut self, opened: bool) {
        self.opened = opened;
    }

    /// True when the port reports high speed; transfer intervals are encoded
    /// as microseconds on the wire using this.
    pub(crate) fn is_high_speed(&self) -> bool {
        self.status.contains(PortStatus::HIGH_SPEED)
    }

    fn index_of(&self, seq_num: u32) -> Option<usize> {
        self.transfers.iter().position(|r| r.seq_num == seq_num)
    }

    fn enqueue_signal(&mut self, signal: PortSignal) {
        debug!(port = self.number, ?signal, "queueing port signal");
        self.signals.push_back(signal);
    }

    /// Appends a transfer and assigns its sequence number. The cursor moves
    /// onto it if every earlier transfer has already been delivered.
    pub(crate) fn enqueue_urb(&mut self, urb: HostUrb) -> u32 {
        let seq_num = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.transfers.push_back(UrbRecord {
            seq_num,
            urb,
            unlink_queued: false,
            result: None,
        });
        if self.cursor.is_none() {
            self.cursor = Some(seq_num);
        }
        seq_num
    }

    /// Host-side cancellation. An undelivered transfer is removed and given
    /// back immediately; a delivered one gets a cancellation event queued
    /// ahead of everything else. Idempotent for records that already have
    /// one queued.
    pub(crate) fn dequeue_urb(&mut self, seq_num: u32, giveback: &mut Vec<GivebackUrb>) {
        let Some(index) = self.index_of(seq_num) else {
            return;
        };
        if self.transfers[index].result.is_none() {
            self.transfers[index].result =
                Some(TransferResult::terminal(HostTransferStatus::Unlinked));
        }
        let undelivered = match self.cursor {
            Some(cursor) => seq_after_eq(seq_num, cursor),
            None => false,
        };
        if undelivered {
            self.remove_record(seq_num, giveback);
            return;
        }
        if self.transfers[index].unlink_queued {
            return;
        }
        self.transfers[index].unlink_queued = true;
        self.cancellations.push_back(seq_num);
    }

    /// Cancels every queued transfer; used on reset and power-off. Delivered
    /// transfers turn into unlink events the emulator will see before the
    /// accompanying signal.
    pub(crate) fn unlink_all_urbs(&mut self, giveback: &mut Vec<GivebackUrb>) {
        let seqs: Vec<u32> = self.transfers.iter().map(|r| r.seq_num).collect();
        for seq_num in seqs {
            if let Some(index) = self.index_of(seq_num) {
                if self.transfers[index].result.is_none() {
                    self.transfers[index].result =
                        Some(TransferResult::terminal(HostTransferStatus::Unlinked));
                }
                self.dequeue_urb(seq_num, giveback);
            }
        }
    }

    /// Drops all pending events and gives every transfer back with a
    /// device-lost status. Runs on detach and on final teardown.
    pub(crate) fn flush_all(&mut self, giveback: &mut Vec<GivebackUrb>) {
        self.signals.clear();
        let seqs: Vec<u32> = self.transfers.iter().map(|r| r.seq_num).collect();
        for seq_num in seqs {
            if let Some(index) = self.index_of(seq_num) {
                self.transfers[index].result =
                    Some(TransferResult::terminal(HostTransferStatus::DeviceLost));
                self.remove_record(seq_num, giveback);
            }
        }
        debug_assert!(self.cancellations.is_empty());
        debug_assert!(self.cursor.is_none());
    }

    /// The event the reader would receive next: cancellations first, then
    /// signals, then the transfer at the cursor.
    pub(crate) fn current_event(&self) -> Option<QueuedEvent> {
        if let Some(&seq_num) = self.cancellations.front() {
            return Some(QueuedEvent::Unlink { seq_num });
        }
        if let Some(&signal) = self.signals.front() {
            return Some(QueuedEvent::Signal(signal));
        }
        self.cursor.map(|seq_num| QueuedEvent::Transfer { seq_num })
    }

    /// Consumes the current event after it has been delivered.
    pub(crate) fn proceed(&mut self) {
        if let Some(seq_num) = self.cancellations.pop_front() {
            // The emulator has seen the unlink; the record no longer has a
            // cancellation entry paired with it.
            if let Some(index) = self.index_of(seq_num) {
                debug_assert!(self.transfers[index].unlink_queued);
                self.transfers[index].unlink_queued = false;
            }
            return;
        }
        if self.signals.pop_front().is_some() {
            return;
        }
        self.advance_cursor();
    }

    fn advance_cursor(&mut self) {
        if let Some(cursor) = self.cursor {
            let index = self
                .index_of(cursor)
                .expect("cursor must reference a queued transfer");
            self.cursor = self.transfers.get(index + 1).map(|r| r.seq_num);
        }
    }

    /// Looks up a delivered transfer record. Records at or after the cursor
    /// have not been seen by the emulator yet, so completions for them are
    /// not acceptable.
    pub(crate) fn find_delivered(&self, seq_num: u32) -> Option<&UrbRecord> {
        if let Some(cursor) = self.cursor {
            if seq_after_eq(seq_num, cursor) {
                return None;
            }
        }
        for record in &self.transfers {
            if record.seq_num == seq_num {
                return Some(record);
            }
            if seq_before(seq_num, record.seq_num) {
                break;
            }
        }
        None
    }

    pub(crate) fn record(&self, seq_num: u32) -> Option<&UrbRecord> {
        let index = self.index_of(seq_num)?;
        self.transfers.get(index)
    }

    pub(crate) fn record_mut(&mut self, seq_num: u32) -> Option<&mut UrbRecord> {
        let index = self.index_of(seq_num)?;
        self.transfers.get_mut(index)
    }

    /// Removes a record from the queue and appends it to the giveback list.
    /// Any paired cancellation entry is freed first, and the cursor advances
    /// off the record if it pointed there.
    pub(crate) fn remove_record(&mut self, seq_num: u32, giveback: &mut Vec<GivebackUrb>) {
        let Some(index) = self.index_of(seq_num) else {
            return;
        };
        if self.transfers[index].unlink_queued {
            self.cancellations.retain(|&s| s != seq_num);
            self.transfers[index].unlink_queued = false;
        }
        if self.cursor == Some(seq_num) {
            self.advance_cursor();
        }
        let record = self.transfers.remove(index).unwrap();
        giveback.push(record.into_giveback());
    }

    /// Re-derives port state from the status word and emits signals for the
    /// edges since the last update. Must run after every status mutation.
    pub(crate) fn update(&mut self, giveback: &mut Vec<GivebackUrb>) {
        self.enabled = false;

        if !self.status.contains(PortStatus::POWER) {
            self.status = PortStatus::empty();
        } else if self.device_attached {
            self.status |= PortStatus::CONNECTION | PortStatus::HIGH_SPEED;
            if !self.old_status.contains(PortStatus::CONNECTION) {
                self.status |= PortStatus::C_CONNECTION;
            }
            if !self.status.contains(PortStatus::ENABLE) {
                self.status -= PortStatus::SUSPEND;
            } else if !self.status.contains(PortStatus::SUSPEND) && !self.hcd_suspended {
                self.enabled = true;
            }
        } else {
            self.status -= PortStatus::CONNECTION
                | PortStatus::ENABLE
                | PortStatus::LOW_SPEED
                | PortStatus::HIGH_SPEED
                | PortStatus::SUSPEND;
            if self.old_status.contains(PortStatus::CONNECTION) {
                self.status |= PortStatus::C_CONNECTION;
            }
        }

        if !self.status.contains(PortStatus::ENABLE) || self.enabled {
            self.resuming = false;
        }

        if self.device_attached {
            let power_off = self.old_status.contains(PortStatus::POWER)
                && !self.status.contains(PortStatus::POWER);
            if power_off {
                // Power-off wins over a reset resolving in the same cycle;
                // the reset edge is discarded.
                self.unlink_all_urbs(giveback);
                self.enqueue_signal(PortSignal::PowerOff);
            } else {
                if !self.old_status.contains(PortStatus::RESET)
                    && self.status.contains(PortStatus::RESET)
                {
                    self.unlink_all_urbs(giveback);
                    self.enqueue_signal(PortSignal::ResetStart);
                } else if self.old_status.contains(PortStatus::RESET)
                    && !self.status.contains(PortStatus::RESET)
                {
                    self.enqueue_signal(PortSignal::ResetEnd);
                }
                if !self.old_status.contains(PortStatus::POWER)
                    && self.status.contains(PortStatus::POWER)
                {
                    self.enqueue_signal(PortSignal::PowerOn);
                }
            }
        }

        if !self.device_attached && self.old_status.contains(PortStatus::CONNECTION) {
            debug!(port = self.number, "device detached, flushing port");
            self.flush_all(giveback);
        }

        self.old_status = self.status;
    }
}
