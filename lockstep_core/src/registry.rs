// Connection registry: a generation-checked arena of participants.
//
// Each slot holds the public `ParticipantInfo` and, for remote peers, the
// `PeerConnection` carrying the link and handshake bookkeeping. Info and
// connection share one slot and one capacity, so they can never drift apart.
// Slot 0 is reserved for the host (`ParticipantId::HOST`), which has info
// but no connection.
//
// Releasing a slot bumps its generation. A `ParticipantId` held after its
// participant left is therefore detectably stale: every lookup checks the
// generation, so a newcomer reusing the slot is never reached through an old
// handle. A slot whose generation would wrap is retired instead of reused,
// so an old handle can never alias a later participant.
//
// Iteration is over `ids()` snapshots rather than live borrows, so callers
// can release participants while walking the list without revisiting a freed
// slot.

use std::io;

use lockstep_protocol::message::{CommandPacket, ParticipantInfo, ServerMessage};
use lockstep_protocol::types::{GroupSelector, MAX_CLIENT_NAME_LENGTH, ParticipantId};
use thiserror::Error;

use crate::handshake::Handshake;
use crate::link::Link;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry capacity must be at least 1")]
    ZeroCapacity,

    #[error("session is full ({capacity} participants)")]
    Full { capacity: usize },

    #[error("host entry is already allocated")]
    HostTaken,
}

/// Host-side state of one remote peer.
pub struct PeerConnection {
    pub id: ParticipantId,
    pub address: String,
    pub handshake: Handshake,
    /// Last tick the peer reported having executed.
    pub last_acked_tick: u64,
    /// Host tick at which that report arrived.
    pub last_acked_server_tick: u64,
    /// Commands held back while the peer loads the session snapshot.
    pub deferred: Vec<CommandPacket>,
    /// Commands from this peer waiting for the next distribution.
    pub queued_commands: u32,
    link: Box<dyn Link<ServerMessage>>,
}

impl PeerConnection {
    pub fn send(&mut self, message: &ServerMessage) -> io::Result<()> {
        self.link.send(message)
    }

    pub fn close_link(&mut self) {
        self.link.close();
    }
}

struct Entry {
    info: ParticipantInfo,
    connection: Option<PeerConnection>,
}

#[derive(Default)]
struct Slot {
    generation: u16,
    /// Set once every generation has been handed out.
    retired: bool,
    entry: Option<Entry>,
}

impl Slot {
    fn is_free(&self) -> bool {
        self.entry.is_none() && !self.retired
    }
}

/// Fixed-capacity participant table.
pub struct Registry {
    slots: Vec<Slot>,
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Result<Self, RegistryError> {
        if capacity == 0 {
            return Err(RegistryError::ZeroCapacity);
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.push(Slot::default());
        Ok(Registry { slots, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live participants, host included.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `allocate` would fail. The host slot does not count.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity && !self.slots.iter().skip(1).any(Slot::is_free)
    }

    /// Register the host itself in the reserved slot.
    pub fn allocate_host(
        &mut self,
        name: String,
        group: GroupSelector,
    ) -> Result<ParticipantId, RegistryError> {
        let slot = &mut self.slots[0];
        if slot.entry.is_some() {
            return Err(RegistryError::HostTaken);
        }
        slot.entry = Some(Entry {
            info: ParticipantInfo {
                id: ParticipantId::HOST,
                name,
                group,
            },
            connection: None,
        });
        Ok(ParticipantId::HOST)
    }

    /// Register a newly connected peer. Its name and group are filled in
    /// once it has sent `Join`.
    pub fn allocate(
        &mut self,
        link: Box<dyn Link<ServerMessage>>,
        address: String,
        now: u64,
    ) -> Result<ParticipantId, RegistryError> {
        let index = match self
            .slots
            .iter()
            .skip(1)
            .position(Slot::is_free)
        {
            Some(offset) => offset + 1,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
            None => {
                return Err(RegistryError::Full {
                    capacity: self.capacity,
                });
            }
        };

        let slot = &mut self.slots[index];
        let id = ParticipantId {
            slot: index as u16,
            generation: slot.generation,
        };
        slot.entry = Some(Entry {
            info: ParticipantInfo {
                id,
                name: String::new(),
                group: GroupSelector::Spectator,
            },
            connection: Some(PeerConnection {
                id,
                address,
                handshake: Handshake::new(now),
                last_acked_tick: 0,
                last_acked_server_tick: now,
                deferred: Vec::new(),
                queued_commands: 0,
                link,
            }),
        });
        Ok(id)
    }

    fn entry(&self, id: ParticipantId) -> Option<&Entry> {
        self.slots
            .get(usize::from(id.slot))
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.entry.as_ref())
    }

    fn entry_mut(&mut self, id: ParticipantId) -> Option<&mut Entry> {
        self.slots
            .get_mut(usize::from(id.slot))
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.entry.as_mut())
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.entry(id).is_some()
    }

    pub fn lookup(&self, id: ParticipantId) -> Option<&PeerConnection> {
        self.entry(id).and_then(|e| e.connection.as_ref())
    }

    pub fn lookup_mut(&mut self, id: ParticipantId) -> Option<&mut PeerConnection> {
        self.entry_mut(id).and_then(|e| e.connection.as_mut())
    }

    pub fn info(&self, id: ParticipantId) -> Option<&ParticipantInfo> {
        self.entry(id).map(|e| &e.info)
    }

    pub fn info_mut(&mut self, id: ParticipantId) -> Option<&mut ParticipantInfo> {
        self.entry_mut(id).map(|e| &mut e.info)
    }

    /// Remove a participant. The slot's generation is bumped so `id` and any
    /// copies of it go stale; a slot on its last generation is retired.
    pub fn release(
        &mut self,
        id: ParticipantId,
    ) -> Option<(ParticipantInfo, Option<PeerConnection>)> {
        let slot = self
            .slots
            .get_mut(usize::from(id.slot))
            .filter(|s| s.generation == id.generation)?;
        let entry = slot.entry.take()?;
        match slot.generation.checked_add(1) {
            Some(next) => slot.generation = next,
            None => slot.retired = true,
        }
        Some((entry.info, entry.connection))
    }

    /// Snapshot of all live ids, in slot order.
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.slots
            .iter()
            .filter_map(|s| s.entry.as_ref().map(|e| e.info.id))
            .collect()
    }

    /// Snapshot of the ids of remote peers.
    pub fn peer_ids(&self) -> Vec<ParticipantId> {
        self.slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .filter(|e| e.connection.is_some())
            .map(|e| e.info.id)
            .collect()
    }

    fn connections(&self) -> impl Iterator<Item = (&ParticipantInfo, &PeerConnection)> {
        self.slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .filter_map(|e| e.connection.as_ref().map(|c| (&e.info, c)))
    }

    /// Active peers that control a group.
    pub fn count_active_players(&self) -> usize {
        self.connections()
            .filter(|(info, conn)| conn.handshake.is_active() && !info.group.is_spectator())
            .count()
    }

    /// Whether any peer is still being admitted.
    pub fn has_joining(&self) -> bool {
        self.connections().any(|(_, conn)| conn.handshake.is_joining())
    }

    /// Spectating participants. A dedicated host is not counted.
    pub fn spectator_count(&self, dedicated: bool) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .filter(|e| e.info.group.is_spectator())
            .filter(|e| !(dedicated && e.info.id.is_host()))
            .count()
    }

    /// The host plus every active peer.
    pub fn roster(&self) -> Vec<ParticipantInfo> {
        self.slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .filter(|e| e.connection.as_ref().is_none_or(|c| c.handshake.is_active()))
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn name_in_use(&self, name: &str, except: ParticipantId) -> bool {
        self.slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .any(|e| e.info.id != except && e.info.name == name)
    }

    /// `wanted`, or `wanted #2`, `wanted #3`, ... whichever is free first.
    /// The base is shortened when the suffix would push the name past
    /// `MAX_CLIENT_NAME_LENGTH`.
    pub fn unique_name(&self, wanted: &str, except: ParticipantId) -> String {
        if !self.name_in_use(wanted, except) {
            return wanted.to_string();
        }
        (2u32..)
            .map(|n| {
                let suffix = format!(" #{n}");
                let room = MAX_CLIENT_NAME_LENGTH.saturating_sub(suffix.len());
                format!("{}{suffix}", truncate_name(wanted, room))
            })
            .find(|candidate| !self.name_in_use(candidate, except))
            .unwrap_or_else(|| wanted.to_string())
    }
}

/// The longest prefix of `name` that fits in `max_len` bytes without
/// splitting a character.
fn truncate_name(name: &str, max_len: usize) -> &str {
    if name.len() <= max_len {
        return name;
    }
    let end = (0..=max_len)
        .rev()
        .find(|&i| name.is_char_boundary(i))
        .unwrap_or(0);
    &name[..end]
}
