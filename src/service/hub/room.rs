use std::sync::{Arc, Mutex, MutexGuard};

/// One-to-one calls: never more than two participants.
pub const ROOM_CAPACITY: usize = 2;

/// A room exists only while someone is in it. All of its mutable state sits
/// behind one mutex, the per-room lock of the two-tier locking scheme.
pub struct Room {
    state: Mutex<RoomState>,
}

#[derive(Debug, Default)]
pub struct RoomState {
    /// (sid, cid) pairs, in join order.
    pub participants: Vec<(String, String)>,
    pub host_cid: Option<String>,
}

impl Room {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RoomState::default()),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap()
    }
}

impl RoomState {
    pub fn is_full(&self) -> bool {
        self.participants.len() >= ROOM_CAPACITY
    }

    pub fn cid_of(&self, sid: &str) -> Option<&str> {
        self.participants
            .iter()
            .find(|(member_sid, _)| member_sid == sid)
            .map(|(_, cid)| cid.as_str())
    }

    pub fn cids(&self) -> Vec<String> {
        self.participants.iter().map(|(_, cid)| cid.clone()).collect()
    }

    /// Removes a member, handing the host role to whoever remains when the
    /// host left. Returns the removed cid.
    pub fn remove(&mut self, sid: &str) -> Option<String> {
        let index = self
            .participants
            .iter()
            .position(|(member_sid, _)| member_sid == sid)?;
        let (_, cid) = self.participants.remove(index);

        if self.host_cid.as_deref() == Some(cid.as_str()) {
            self.host_cid = self
                .participants
                .first()
                .map(|(_, remaining_cid)| remaining_cid.clone());
        }

        Some(cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(members: &[(&str, &str)], host: Option<&str>) -> RoomState {
        RoomState {
            participants: members
                .iter()
                .map(|(sid, cid)| ((*sid).to_owned(), (*cid).to_owned()))
                .collect(),
            host_cid: host.map(str::to_owned),
        }
    }

    #[test]
    fn capacity_is_two() {
        let state = state_with(&[("S-1", "C-1"), ("S-2", "C-2")], Some("C-1"));
        assert!(state.is_full());

        let state = state_with(&[("S-1", "C-1")], Some("C-1"));
        assert!(!state.is_full());
    }

    #[test]
    fn host_transfers_to_a_remaining_participant() {
        let mut state = state_with(&[("S-1", "C-1"), ("S-2", "C-2")], Some("C-1"));

        assert_eq!(state.remove("S-1").as_deref(), Some("C-1"));
        assert_eq!(state.host_cid.as_deref(), Some("C-2"));
    }

    #[test]
    fn host_survives_a_peer_leaving() {
        let mut state = state_with(&[("S-1", "C-1"), ("S-2", "C-2")], Some("C-1"));

        assert_eq!(state.remove("S-2").as_deref(), Some("C-2"));
        assert_eq!(state.host_cid.as_deref(), Some("C-1"));
    }

    #[test]
    fn removing_the_last_member_clears_the_host() {
        let mut state = state_with(&[("S-1", "C-1")], Some("C-1"));

        assert_eq!(state.remove("S-1").as_deref(), Some("C-1"));
        assert!(state.host_cid.is_none());
        assert!(state.participants.is_empty());
    }

    #[test]
    fn removing_an_unknown_sid_is_a_no_op() {
        let mut state = state_with(&[("S-1", "C-1")], Some("C-1"));
        assert_eq!(state.remove("S-9"), None);
        assert_eq!(state.participants.len(), 1);
    }
}
