//! Per-client notification buffers
//!
//! Each client owns one fixed-capacity byte ring holding framed records:
//!
//! ```text
//! | connection u32 | generation u32 | value handle u16 | length u16 | value ... |
//! ```
//!
//! all little-endian. Records are consumed whole and in FIFO order. A producer
//! that finds too little space waits on the buffer's own condition variable,
//! never on the stack lock, and drops the record when the wait times out.

use crate::connection::ConnectionId;
use crate::error::{BtError, BtResult};
use crate::gap::ClientId;
use crate::gatt::types::CharacteristicRef;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Bytes of framing in front of every buffered value
pub const NOTIFICATION_HEADER_SIZE: usize = 12;

/// Framing of the next buffered record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationHeader {
    pub characteristic: CharacteristicRef,
    pub value_length: usize,
}

impl NotificationHeader {
    fn encode(&self) -> [u8; NOTIFICATION_HEADER_SIZE] {
        let mut bytes = [0u8; NOTIFICATION_HEADER_SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], self.characteristic.connection.0);
        LittleEndian::write_u32(&mut bytes[4..8], self.characteristic.generation);
        LittleEndian::write_u16(&mut bytes[8..10], self.characteristic.value_handle);
        LittleEndian::write_u16(&mut bytes[10..12], self.value_length as u16);
        bytes
    }

    fn decode(bytes: &[u8; NOTIFICATION_HEADER_SIZE]) -> Self {
        Self {
            characteristic: CharacteristicRef {
                connection: ConnectionId(LittleEndian::read_u32(&bytes[0..4])),
                generation: LittleEndian::read_u32(&bytes[4..8]),
                value_handle: LittleEndian::read_u16(&bytes[8..10]),
            },
            value_length: LittleEndian::read_u16(&bytes[10..12]) as usize,
        }
    }
}

/// Result of [`BleStack::consume_notification`](crate::BleStack::consume_notification)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumedNotification {
    /// `None` when the buffer was empty
    pub characteristic: Option<CharacteristicRef>,
    /// Bytes copied into the caller's buffer
    pub value_length: usize,
    /// Whether more records are waiting
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// `raise_event` is set when the buffer had no event outstanding
    Stored { raise_event: bool },
    Dropped,
}

#[derive(Debug, Default)]
struct Ring {
    /// `None` until the client's first subscription
    storage: Option<VecDeque<u8>>,
    event_pending: bool,
}

#[derive(Debug)]
pub(crate) struct NotificationBuffer {
    capacity: usize,
    ring: Mutex<Ring>,
    space_freed: Condvar,
}

impl NotificationBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ring: Mutex::new(Ring::default()),
            space_freed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves the ring; returns whether this call did the allocation
    pub fn allocate(&self) -> BtResult<bool> {
        let mut ring = self.lock();
        if ring.storage.is_some() {
            return Ok(false);
        }
        let mut storage = VecDeque::new();
        storage
            .try_reserve_exact(self.capacity)
            .map_err(|_| BtError::NotEnoughResources)?;
        ring.storage = Some(storage);
        Ok(true)
    }

    /// Frees the ring and wakes any waiting producer so it can give up
    pub fn release(&self) {
        let mut ring = self.lock();
        ring.storage = None;
        ring.event_pending = false;
        self.space_freed.notify_all();
    }

    pub fn is_allocated(&self) -> bool {
        self.lock().storage.is_some()
    }

    /// Appends one record, waiting up to `timeout` for room
    pub fn push(&self, header: &NotificationHeader, value: &[u8], timeout: Duration) -> PushOutcome {
        let record_len = NOTIFICATION_HEADER_SIZE + value.len();
        if record_len > self.capacity {
            warn!(
                "Notification of {} bytes can never fit a {} byte buffer",
                value.len(),
                self.capacity
            );
            return PushOutcome::Dropped;
        }

        let capacity = self.capacity;
        let lacks_room =
            |ring: &mut Ring| matches!(&ring.storage, Some(s) if capacity - s.len() < record_len);

        let mut ring = self.lock();
        if lacks_room(&mut *ring) {
            debug!("Notification buffer full, waiting up to {:?}", timeout);
            ring = self
                .space_freed
                .wait_timeout_while(ring, timeout, lacks_room)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }

        let Some(storage) = ring.storage.as_mut() else {
            return PushOutcome::Dropped;
        };
        if capacity - storage.len() < record_len {
            debug!(
                "Dropping {} byte notification on handle 0x{:04X}, consumer too slow",
                value.len(),
                header.characteristic.value_handle
            );
            return PushOutcome::Dropped;
        }

        storage.extend(header.encode());
        storage.extend(value.iter().copied());
        trace!(
            "Buffered notification on handle 0x{:04X}: {}",
            header.characteristic.value_handle,
            hex::encode(value)
        );

        let raise_event = !ring.event_pending;
        ring.event_pending = true;
        PushOutcome::Stored { raise_event }
    }

    pub fn peek_header(&self) -> Option<NotificationHeader> {
        let ring = self.lock();
        let storage = ring.storage.as_ref()?;
        read_header(storage)
    }

    /// Removes the next record whole, copying as much of its value as fits in `out`
    pub fn consume(&self, out: &mut [u8]) -> ConsumedNotification {
        let mut ring = self.lock();
        let Some(storage) = ring.storage.as_mut() else {
            return ConsumedNotification::default();
        };
        let Some(header) = read_header(storage) else {
            return ConsumedNotification::default();
        };

        storage.drain(..NOTIFICATION_HEADER_SIZE);
        let copied = header.value_length.min(out.len());
        for (dst, src) in out.iter_mut().zip(storage.drain(..header.value_length)) {
            *dst = src;
        }
        if copied < header.value_length {
            debug!(
                "Truncated notification from {} to {} bytes",
                header.value_length, copied
            );
        }

        let has_more = !storage.is_empty();
        if !has_more {
            ring.event_pending = false;
        }
        self.space_freed.notify_all();

        ConsumedNotification {
            characteristic: Some(header.characteristic),
            value_length: copied,
            has_more,
        }
    }
}

fn read_header(storage: &VecDeque<u8>) -> Option<NotificationHeader> {
    if storage.len() < NOTIFICATION_HEADER_SIZE {
        return None;
    }
    let mut bytes = [0u8; NOTIFICATION_HEADER_SIZE];
    for (dst, src) in bytes.iter_mut().zip(storage.iter()) {
        *dst = *src;
    }
    Some(NotificationHeader::decode(&bytes))
}

/// One buffer per client
#[derive(Debug)]
pub(crate) struct NotificationBuffers {
    buffers: [NotificationBuffer; 2],
}

impl NotificationBuffers {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: [
                NotificationBuffer::new(capacity),
                NotificationBuffer::new(capacity),
            ],
        }
    }

    pub fn buffer(&self, client: ClientId) -> &NotificationBuffer {
        &self.buffers[client.index()]
    }
}
