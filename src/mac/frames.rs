//! Transaction queue between the request surface and the channel-access
//! engine.
//!
//! The engine never owns a frame. It holds a [`FrameId`] into the manager's
//! storage for the duration of one attempt and reports the outcome back.
//! Each transaction is sent `retries + 1` times (reliability repeats) and
//! completes with a single [`Completion`].

use std::time::{Duration, Instant};

use log::{debug, warn};

use super::commands::CommandId;
use super::phy::Framing;
use super::primitives::{ChannelSetIndex, ChannelSets, DataStatus, Destination, Handle};

/// Default number of transactions held at once.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Arena handle to a queued transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId {
    index: usize,
    generation: u32,
}

/// Upper-layer service a transaction belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Data,
    Ping,
    TimeQuery,
}

/// Who is waiting for a transaction to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A request that gets a confirmation.
    Upstream { handle: Handle, service: Service },
    /// A command frame the MAC generated itself.
    Command(CommandId),
}

/// A frame waiting to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub origin: Origin,
    pub dst: Destination,
    pub payload: Vec<u8>,
    pub priority: u8,
    /// Extra transmissions after the first.
    pub retries: u8,
    pub channel_sets: ChannelSets,
    pub channel_set_index: ChannelSetIndex,
    pub droppable: bool,
    pub skip_cca: bool,
}

impl Transaction {
    /// Transaction carrying a MAC command generated by this node.
    pub fn command(command: CommandId, dst: Destination, payload: Vec<u8>) -> Self {
        Self {
            origin: Origin::Command(command),
            dst,
            payload,
            priority: command.priority(),
            retries: 0,
            channel_sets: ChannelSets::Srfn,
            channel_set_index: command.channel_set_index(),
            droppable: command.droppable(),
            skip_cca: false,
        }
    }

    pub fn framing(&self) -> Framing {
        match self.channel_sets {
            ChannelSets::Srfn => Framing::Srfn,
            ChannelSets::Star => Framing::Star,
        }
    }

    pub fn is_time_set(&self) -> bool {
        self.origin == Origin::Command(CommandId::TimeSet)
    }

    /// Whether the frame goes out as a MAC command rather than user data.
    pub fn is_command_frame(&self) -> bool {
        !matches!(
            self.origin,
            Origin::Upstream {
                service: Service::Data,
                ..
            }
        )
    }

    /// Handle of the upstream request, if any.
    pub fn handle(&self) -> Option<Handle> {
        match self.origin {
            Origin::Upstream { handle, .. } => Some(handle),
            Origin::Command(_) => None,
        }
    }
}

/// Final outcome of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub origin: Origin,
    pub dst: Destination,
    pub status: DataStatus,
}

/// Transaction queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

impl std::fmt::Display for QueueFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transaction queue full")
    }
}

impl std::error::Error for QueueFull {}

/// Frame-management collaborator used by the engine.
pub trait FrameManager {
    /// Queue a transaction.
    fn create(&mut self, transaction: Transaction, now: Instant) -> Result<FrameId, QueueFull>;

    /// Next frame to send (highest priority, then oldest). The frame is in
    /// flight until confirmed, failed or marked for resend.
    fn next_ready(&mut self) -> Option<FrameId>;

    /// Whether [`FrameManager::next_ready`] would return a frame.
    fn has_ready(&self) -> bool;

    fn frame(&self, id: FrameId) -> Option<&Transaction>;

    /// Count one transmission of an in-flight frame. Returns the completion
    /// once every repeat has been sent.
    fn confirm(&mut self, id: FrameId, success: bool) -> Option<Completion>;

    /// Fail an in-flight frame outright, skipping remaining repeats.
    fn fail(&mut self, id: FrameId) -> Option<Completion>;

    /// Put an in-flight frame back in the queue without counting a
    /// transmission.
    fn mark_resend(&mut self, id: FrameId);

    /// Fail idle transactions older than `timeout`.
    fn check_timeouts(&mut self, now: Instant, timeout: Duration) -> Vec<Completion>;

    /// Fail every idle transaction.
    fn flush(&mut self) -> Vec<Completion>;

    /// Fail the idle transaction with this handle. `None` when no such
    /// transaction exists or it is in flight.
    fn purge(&mut self, handle: Handle) -> Option<Completion>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Entry {
    transaction: Transaction,
    created: Instant,
    seq: u64,
    sent: u8,
    delivered: bool,
    in_flight: bool,
}

impl Entry {
    fn completion(self, status: DataStatus) -> Completion {
        Completion {
            origin: self.transaction.origin,
            dst: self.transaction.dst,
            status,
        }
    }
}

/// Bounded in-memory [`FrameManager`].
#[derive(Debug)]
pub struct TxQueue {
    slots: Vec<Option<Entry>>,
    generations: Vec<u32>,
    next_seq: u64,
}

impl Default for TxQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl TxQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            generations: vec![0; capacity],
            next_seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn entry(&self, id: FrameId) -> Option<&Entry> {
        if self.generations.get(id.index) != Some(&id.generation) {
            return None;
        }
        self.slots.get(id.index)?.as_ref()
    }

    fn entry_mut(&mut self, id: FrameId) -> Option<&mut Entry> {
        if self.generations.get(id.index) != Some(&id.generation) {
            return None;
        }
        self.slots.get_mut(id.index)?.as_mut()
    }

    fn remove(&mut self, index: usize) -> Option<Entry> {
        let entry = self.slots.get_mut(index)?.take()?;
        self.generations[index] = self.generations[index].wrapping_add(1);
        Some(entry)
    }

    fn remove_idle_where(&mut self, pred: impl Fn(&Entry) -> bool) -> Vec<Completion> {
        let indices: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Some(entry) if !entry.in_flight && pred(entry) => Some(i),
                _ => None,
            })
            .collect();
        indices
            .into_iter()
            .filter_map(|i| self.remove(i))
            .map(|entry| entry.completion(DataStatus::TransactionFailed))
            .collect()
    }

    fn ready_index(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|entry| (i, entry)))
            .filter(|(_, entry)| !entry.in_flight)
            .max_by(|(_, a), (_, b)| {
                a.transaction
                    .priority
                    .cmp(&b.transaction.priority)
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|(i, _)| i)
    }
}

impl FrameManager for TxQueue {
    fn create(&mut self, transaction: Transaction, now: Instant) -> Result<FrameId, QueueFull> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(QueueFull)?;
        self.slots[index] = Some(Entry {
            transaction,
            created: now,
            seq: self.next_seq,
            sent: 0,
            delivered: false,
            in_flight: false,
        });
        self.next_seq += 1;
        Ok(FrameId {
            index,
            generation: self.generations[index],
        })
    }

    fn next_ready(&mut self) -> Option<FrameId> {
        let index = self.ready_index()?;
        let entry = self.slots[index].as_mut()?;
        entry.in_flight = true;
        Some(FrameId {
            index,
            generation: self.generations[index],
        })
    }

    fn has_ready(&self) -> bool {
        self.ready_index().is_some()
    }

    fn frame(&self, id: FrameId) -> Option<&Transaction> {
        self.entry(id).map(|entry| &entry.transaction)
    }

    fn confirm(&mut self, id: FrameId, success: bool) -> Option<Completion> {
        let Some(entry) = self.entry_mut(id) else {
            warn!("confirm for unknown frame {:?}", id);
            return None;
        };
        entry.sent = entry.sent.saturating_add(1);
        entry.delivered |= success;
        entry.in_flight = false;
        if entry.sent <= entry.transaction.retries {
            debug!(
                "frame {:?} sent {} of {} times",
                id,
                entry.sent,
                u16::from(entry.transaction.retries) + 1
            );
            return None;
        }
        let status = if entry.delivered {
            DataStatus::Success
        } else {
            DataStatus::TransactionFailed
        };
        self.remove(id.index).map(|entry| entry.completion(status))
    }

    fn fail(&mut self, id: FrameId) -> Option<Completion> {
        self.entry(id)?;
        self.remove(id.index)
            .map(|entry| entry.completion(DataStatus::TransactionFailed))
    }

    fn mark_resend(&mut self, id: FrameId) {
        if let Some(entry) = self.entry_mut(id) {
            entry.in_flight = false;
        }
    }

    fn check_timeouts(&mut self, now: Instant, timeout: Duration) -> Vec<Completion> {
        self.remove_idle_where(|entry| now.saturating_duration_since(entry.created) > timeout)
    }

    fn flush(&mut self) -> Vec<Completion> {
        self.remove_idle_where(|_| true)
    }

    fn purge(&mut self, handle: Handle) -> Option<Completion> {
        let index = self.slots.iter().position(|slot| {
            matches!(slot, Some(entry) if entry.transaction.handle() == Some(handle))
        })?;
        if self.slots[index].as_ref()?.in_flight {
            return None;
        }
        self.remove(index)
            .map(|entry| entry.completion(DataStatus::TransactionFailed))
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
