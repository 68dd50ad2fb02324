/*
 * Petrel mail transfer engine
 * Copyright (C) 2024 the Petrel developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

use petrel_common::{Address, SmtpError};

/// Delivery verdict for one recipient.
pub type DeliveryStatus = Result<(), SmtpError>;

/// Collects per-recipient delivery verdicts during an LMTP body transfer.
///
/// Built from the ordered recipient list (duplicates allowed); each
/// occurrence owns one slot. The receiver consumes the slots in insertion
/// order and turns each into exactly one wire reply, as soon as it is
/// filled.
pub struct StatusCollector {
    // per distinct recipient, the unfilled slot senders, front first
    pending: Vec<(Address, std::collections::VecDeque<tokio::sync::oneshot::Sender<DeliveryStatus>>)>,
}

/// Consumer half: one receiver per recipient occurrence, in wire order.
pub(crate) struct StatusSlots {
    pub(crate) slots: Vec<(Address, tokio::sync::oneshot::Receiver<DeliveryStatus>)>,
}

impl StatusCollector {
    /// Split the ordered recipient list into the collector handed to the
    /// backend and the reply slots kept by the receiver.
    pub(crate) fn new(recipients: &[Address]) -> (Self, StatusSlots) {
        let mut pending: Vec<(Address, std::collections::VecDeque<_>)> = Vec::new();
        let mut slots = Vec::with_capacity(recipients.len());

        for rcpt in recipients {
            let (tx, rx) = tokio::sync::oneshot::channel();
            slots.push((rcpt.clone(), rx));
            match pending.iter_mut().find(|(known, _)| known == rcpt) {
                Some((_, queue)) => queue.push_back(tx),
                None => {
                    let mut queue = std::collections::VecDeque::with_capacity(1);
                    queue.push_back(tx);
                    pending.push((rcpt.clone(), queue));
                }
            }
        }
        (Self { pending }, StatusSlots { slots })
    }

    /// Report the verdict for the next unfilled occurrence of `rcpt`.
    ///
    /// # Panics
    ///
    /// * `rcpt` is not in the recipient list
    /// * called more often for `rcpt` than it occurred
    #[allow(clippy::panic)]
    #[inline]
    pub fn set_status(&mut self, rcpt: &Address, status: DeliveryStatus) {
        let Some((_, queue)) = self.pending.iter_mut().find(|(known, _)| known == rcpt) else {
            panic!("set_status called for unknown recipient <{rcpt}>");
        };
        let Some(slot) = queue.pop_front() else {
            panic!("set_status called more than once per occurrence of <{rcpt}>");
        };
        // the consumer only goes away with the connection
        let _lost = slot.send(status);
    }

    /// Write `status` into every slot that is still unfilled. Called by the
    /// receiver after the backend returns (panics included) so that every
    /// recipient gets its reply.
    #[inline]
    pub fn fill_remaining(&mut self, status: &DeliveryStatus) {
        for (_, queue) in &mut self.pending {
            while let Some(slot) = queue.pop_front() {
                let _lost = slot.send(status.clone());
            }
        }
    }

    /// Number of slots not yet filled.
    #[must_use]
    #[inline]
    pub fn remaining(&self) -> usize {
        self.pending.iter().map(|(_, queue)| queue.len()).sum()
    }
}
