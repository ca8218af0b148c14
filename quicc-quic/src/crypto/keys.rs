//! One-shot key handoff between the handshake and the packet codec.
//!
//! Ownership of each derived key moves exactly once: the handshake installs
//! it, the transport takes it, and the slot reports empty forever after.
//! This removes any shared ownership of key material; a second read of the
//! same slot is a programming error that shows up immediately in tests.

use crate::crypto::backend::PacketProtection;
use crate::error::{Error, Result};
use crate::types::{EncryptionLevel, KeyDirection};

/// Slots managed by the scheduler. Initial keys are derived deterministically
/// from the destination connection id and never pass through here; 0-RTT has
/// no read direction on the client.
const SLOT_COUNT: usize = 5;

fn slot_index(level: EncryptionLevel, direction: KeyDirection) -> Option<usize> {
    match (level, direction) {
        (EncryptionLevel::ZeroRtt, KeyDirection::Write) => Some(0),
        (EncryptionLevel::Handshake, KeyDirection::Read) => Some(1),
        (EncryptionLevel::Handshake, KeyDirection::Write) => Some(2),
        (EncryptionLevel::OneRtt, KeyDirection::Read) => Some(3),
        (EncryptionLevel::OneRtt, KeyDirection::Write) => Some(4),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct KeyScheduler {
    slots: [Option<PacketProtection>; SLOT_COUNT],
    /// Set once a slot has been populated, so `install` can distinguish
    /// "already taken" from "never produced".
    installed: [bool; SLOT_COUNT],
}

impl KeyScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly derived protection pair. Rejects double installs
    /// and unmanaged slots.
    pub fn install(
        &mut self,
        level: EncryptionLevel,
        direction: KeyDirection,
        protection: PacketProtection,
    ) -> Result<()> {
        let idx = slot_index(level, direction)
            .ok_or(Error::InternalError("key install into unmanaged slot"))?;
        if self.installed[idx] {
            return Err(Error::InternalError("key slot installed twice"));
        }
        tracing::debug!(?level, ?direction, "packet protection installed");
        self.installed[idx] = true;
        self.slots[idx] = Some(protection);
        Ok(())
    }

    /// Edge-triggered handoff: returns the keys once, then `None` forever.
    pub fn take(
        &mut self,
        level: EncryptionLevel,
        direction: KeyDirection,
    ) -> Option<PacketProtection> {
        self.slots[slot_index(level, direction)?].take()
    }

    /// Non-consuming availability query used by the write path.
    pub fn has(&self, level: EncryptionLevel, direction: KeyDirection) -> bool {
        slot_index(level, direction)
            .map(|idx| self.slots[idx].is_some())
            .unwrap_or(false)
    }

    /// Drop an installed-but-untaken key, e.g. the Handshake read keys once
    /// the connection is established.
    pub fn discard(&mut self, level: EncryptionLevel, direction: KeyDirection) {
        if let Some(idx) = slot_index(level, direction) {
            if self.slots[idx].take().is_some() {
                tracing::debug!(?level, ?direction, "packet protection discarded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::rust_crypto::initial_packet_protection;
    use crate::types::{ConnectionId, VERSION_1};

    fn protection() -> PacketProtection {
        let cid = ConnectionId::from_slice(&[1, 2, 3, 4]).unwrap();
        initial_packet_protection(&cid, VERSION_1, KeyDirection::Write).unwrap()
    }

    #[test]
    fn take_is_one_shot() {
        let mut keys = KeyScheduler::new();
        keys.install(EncryptionLevel::Handshake, KeyDirection::Write, protection())
            .unwrap();
        assert!(keys.has(EncryptionLevel::Handshake, KeyDirection::Write));
        assert!(keys
            .take(EncryptionLevel::Handshake, KeyDirection::Write)
            .is_some());
        assert!(!keys.has(EncryptionLevel::Handshake, KeyDirection::Write));
        assert!(keys
            .take(EncryptionLevel::Handshake, KeyDirection::Write)
            .is_none());
    }

    #[test]
    fn double_install_is_rejected() {
        let mut keys = KeyScheduler::new();
        keys.install(EncryptionLevel::OneRtt, KeyDirection::Read, protection())
            .unwrap();
        assert!(keys
            .install(EncryptionLevel::OneRtt, KeyDirection::Read, protection())
            .is_err());
    }

    #[test]
    fn double_install_rejected_even_after_take() {
        let mut keys = KeyScheduler::new();
        keys.install(EncryptionLevel::OneRtt, KeyDirection::Write, protection())
            .unwrap();
        keys.take(EncryptionLevel::OneRtt, KeyDirection::Write)
            .unwrap();
        assert!(keys
            .install(EncryptionLevel::OneRtt, KeyDirection::Write, protection())
            .is_err());
    }

    #[test]
    fn unmanaged_slots_are_rejected() {
        let mut keys = KeyScheduler::new();
        assert!(keys
            .install(EncryptionLevel::Initial, KeyDirection::Write, protection())
            .is_err());
        assert!(keys
            .install(EncryptionLevel::ZeroRtt, KeyDirection::Read, protection())
            .is_err());
        assert!(!keys.has(EncryptionLevel::Initial, KeyDirection::Read));
        assert!(keys.take(EncryptionLevel::Initial, KeyDirection::Read).is_none());
    }

    #[test]
    fn discard_empties_a_slot() {
        let mut keys = KeyScheduler::new();
        keys.install(EncryptionLevel::Handshake, KeyDirection::Read, protection())
            .unwrap();
        keys.discard(EncryptionLevel::Handshake, KeyDirection::Read);
        assert!(!keys.has(EncryptionLevel::Handshake, KeyDirection::Read));
        assert!(keys
            .take(EncryptionLevel::Handshake, KeyDirection::Read)
            .is_none());
    }
}
