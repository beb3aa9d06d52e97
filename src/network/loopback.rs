//! In-process transport for tests and local play.
//!
//! A [`LoopbackNetwork`] is a shared switchboard. Each device takes an endpoint with
//! [`LoopbackNetwork::endpoint`], and the address of a remote device is simply the id of
//! its endpoint. Messages pass through the wire [`codec`], so anything that would not
//! survive UDP does not survive here either.
//!
//! The network can drop a share of all messages, hold messages back for a number of
//! polls, and cut individual links, which is enough to provoke mispredictions,
//! rollbacks and timeouts deterministically.
//!
//! ```
//! use resync_rollback::{DeviceId, LoopbackNetwork, Message, MessageBody, Frame, Transport};
//!
//! let network = LoopbackNetwork::new();
//! let mut a = network.endpoint(DeviceId::new(0));
//! let mut b = network.endpoint(DeviceId::new(1));
//! a.add_remote(DeviceId::new(1), DeviceId::new(1));
//! b.add_remote(DeviceId::new(0), DeviceId::new(0));
//!
//! let message = Message { sequence: 0, body: MessageBody::InputAck { frame: Frame::new(3) } };
//! a.send_to(DeviceId::new(1), &message);
//! assert_eq!(b.receive_from(), vec![(DeviceId::new(0), message)]);
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::network::codec;
use crate::network::messages::Message;
use crate::rng::Pcg32;
use crate::{DeviceId, Transport};

#[derive(Debug)]
struct InFlight {
    from: DeviceId,
    bytes: Vec<u8>,
    remaining_polls: u32,
}

#[derive(Debug, Default)]
struct Switchboard {
    mailboxes: BTreeMap<DeviceId, VecDeque<InFlight>>,
    cut_links: BTreeSet<(DeviceId, DeviceId)>,
    isolated: BTreeSet<DeviceId>,
    latency_polls: u32,
    drop_percent: u32,
    rng: Option<Pcg32>,
    sent: u64,
    dropped: u64,
}

impl Switchboard {
    fn delivers(&mut self, from: DeviceId, to: DeviceId) -> bool {
        if self.isolated.contains(&from)
            || self.isolated.contains(&to)
            || self.cut_links.contains(&(from, to))
        {
            return false;
        }
        if self.drop_percent == 0 {
            return true;
        }
        let drop_percent = self.drop_percent;
        let rng = self.rng.get_or_insert_with(|| Pcg32::seed_from_u64(0));
        rng.gen_range(0..100) >= drop_percent
    }
}

/// Shared in-process network. Cloning yields another handle to the same network.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<Switchboard>>,
}

impl LoopbackNetwork {
    /// Creates an empty network without loss or latency.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the endpoint of device `id`.
    #[must_use]
    pub fn endpoint(&self, id: DeviceId) -> LoopbackTransport {
        self.inner.lock().mailboxes.entry(id).or_default();
        LoopbackTransport {
            id,
            network: self.clone(),
            remotes: BTreeMap::new(),
        }
    }

    /// Drops `percent` of all messages, chosen by a generator seeded with `seed`.
    pub fn set_drop_rate(&self, percent: u32, seed: u64) {
        let mut board = self.inner.lock();
        board.drop_percent = percent.min(100);
        board.rng = Some(Pcg32::seed_from_u64(seed));
    }

    /// Holds every message back for `polls` receive calls of its recipient.
    pub fn set_latency_polls(&self, polls: u32) {
        self.inner.lock().latency_polls = polls;
    }

    /// Stops delivery from `from` to `to`. The opposite direction is unaffected.
    pub fn cut_link(&self, from: DeviceId, to: DeviceId) {
        self.inner.lock().cut_links.insert((from, to));
    }

    /// Restores delivery from `from` to `to`.
    pub fn restore_link(&self, from: DeviceId, to: DeviceId) {
        self.inner.lock().cut_links.remove(&(from, to));
    }

    /// Drops all traffic to and from `id`, including messages already in flight to it.
    pub fn isolate(&self, id: DeviceId) {
        let mut board = self.inner.lock();
        board.isolated.insert(id);
        if let Some(mailbox) = board.mailboxes.get_mut(&id) {
            mailbox.clear();
        }
    }

    /// Messages accepted for delivery so far.
    #[must_use]
    pub fn messages_sent(&self) -> u64 {
        self.inner.lock().sent
    }

    /// Messages dropped so far.
    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}

/// One device's view of a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackTransport {
    id: DeviceId,
    network: LoopbackNetwork,
    // registered device id -> endpoint id
    remotes: BTreeMap<DeviceId, DeviceId>,
}

impl LoopbackTransport {
    /// Endpoint id of this transport.
    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// The network this endpoint belongs to.
    #[must_use]
    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }
}

impl Transport for LoopbackTransport {
    type Address = DeviceId;

    fn add_remote(&mut self, device_id: DeviceId, address: DeviceId) {
        self.remotes.insert(device_id, address);
    }

    fn send_to(&mut self, device_id: DeviceId, message: &Message) -> usize {
        let Some(&to) = self.remotes.get(&device_id) else {
            tracing::trace!(device = %device_id, "no loopback address registered");
            return 0;
        };
        let bytes = match codec::encode_message(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "loopback failed to encode message");
                return 0;
            }
        };
        let len = bytes.len();

        let mut guard = self.network.inner.lock();
        let board = &mut *guard;
        if !board.delivers(self.id, to) {
            board.dropped += 1;
            return len;
        }
        let remaining_polls = board.latency_polls;
        let Some(mailbox) = board.mailboxes.get_mut(&to) else {
            board.dropped += 1;
            return len;
        };
        mailbox.push_back(InFlight {
            from: self.id,
            bytes,
            remaining_polls,
        });
        board.sent += 1;
        len
    }

    fn receive_from(&mut self) -> Vec<(DeviceId, Message)> {
        let ready: Vec<InFlight> = {
            let mut guard = self.network.inner.lock();
            let Some(mailbox) = guard.mailboxes.get_mut(&self.id) else {
                return Vec::new();
            };
            let mut ready = Vec::new();
            let mut waiting = VecDeque::with_capacity(mailbox.len());
            for mut entry in mailbox.drain(..) {
                if entry.remaining_polls == 0 {
                    ready.push(entry);
                } else {
                    entry.remaining_polls -= 1;
                    waiting.push_back(entry);
                }
            }
            *mailbox = waiting;
            ready
        };

        ready
            .into_iter()
            .filter_map(|entry| {
                let device_id = self
                    .remotes
                    .iter()
                    .find(|(_, endpoint)| **endpoint == entry.from)
                    .map(|(id, _)| *id)?;
                let message = codec::decode_message(&entry.bytes).ok()?;
                Some((device_id, message))
            })
            .collect()
    }
}
