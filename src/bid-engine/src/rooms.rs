//! Room subscription registry.
//!
//! Tracks which crop listings the session follows and decides which
//! `room:join` / `room:leave` frames go out. The registry keeps its own view
//! of whether the link is up, updated only from delivered connection events,
//! so a join racing a (re)connect is emitted exactly once.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connection::ConnectionError;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Topic id must not be empty")]
    EmptyTopic,

    #[error("Not subscribed to topic {0}")]
    NotJoined(String),

    #[error("Failed to load topic {topic}: {message}")]
    Snapshot { topic: String, message: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Membership of one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Wanted, join not sent yet
    Queued,
    /// Join sent, waiting for `room:joined`
    Joining,
    /// Confirmed by the server
    Joined,
}

/// What the caller must do after `join`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAction {
    /// Send `room:join` now
    Send,
    /// Held until the connection is up
    Queued,
    /// Already tracked
    AlreadyJoined,
}

/// What the caller must do after `leave`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveAction {
    /// Send `room:leave` now
    Send,
    /// Only a queued join existed, it was dropped
    Cancelled,
    NotJoined,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: BTreeMap<String, RoomState>,
    online: bool,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a topic.
    pub fn join(&mut self, topic_id: &str) -> JoinAction {
        if self.rooms.contains_key(topic_id) {
            debug!("[ROOMS] {} already tracked", topic_id);
            return JoinAction::AlreadyJoined;
        }

        if self.online {
            self.rooms.insert(topic_id.to_string(), RoomState::Joining);
            JoinAction::Send
        } else {
            info!("[ROOMS] {} queued until connected", topic_id);
            self.rooms.insert(topic_id.to_string(), RoomState::Queued);
            JoinAction::Queued
        }
    }

    /// Drop interest in a topic.
    pub fn leave(&mut self, topic_id: &str) -> LeaveAction {
        match self.rooms.remove(topic_id) {
            None => LeaveAction::NotJoined,
            Some(RoomState::Queued) => {
                info!("[ROOMS] {} queued join cancelled", topic_id);
                LeaveAction::Cancelled
            }
            Some(_) if self.online => LeaveAction::Send,
            // The server forgot membership with the old link
            Some(_) => LeaveAction::Cancelled,
        }
    }

    /// A join could not be sent; retry it on the next connect.
    pub fn requeue(&mut self, topic_id: &str) {
        if let Some(state) = self.rooms.get_mut(topic_id) {
            *state = RoomState::Queued;
        }
    }

    /// Link is up: every tracked topic needs one join, returned in order.
    pub fn on_connected(&mut self) -> Vec<String> {
        self.online = true;
        let topics: Vec<String> = self.rooms.keys().cloned().collect();
        for state in self.rooms.values_mut() {
            *state = RoomState::Joining;
        }
        if !topics.is_empty() {
            info!("[ROOMS] Joining {} rooms after connect", topics.len());
        }
        topics
    }

    /// Link is gone: memberships must be re-established later.
    pub fn on_disconnected(&mut self) {
        self.online = false;
        for state in self.rooms.values_mut() {
            *state = RoomState::Queued;
        }
    }

    /// Handle `room:joined`. Returns false for rooms we no longer track.
    pub fn confirm_joined(&mut self, topic_id: &str) -> bool {
        match self.rooms.get_mut(topic_id) {
            Some(state) => {
                *state = RoomState::Joined;
                debug!("[ROOMS] {} joined", topic_id);
                true
            }
            None => {
                warn!("[ROOMS] Join confirmation for untracked topic {}", topic_id);
                false
            }
        }
    }

    /// Handle a server-side `room:left` for a room we still want.
    ///
    /// Returns true when a fresh `room:join` must be sent now. Offline, the
    /// room waits for the next connect like any other queued join.
    pub fn confirm_left(&mut self, topic_id: &str) -> bool {
        let online = self.online;
        match self.rooms.get_mut(topic_id) {
            Some(state) if online => {
                warn!("[ROOMS] Server removed us from {}, rejoining", topic_id);
                *state = RoomState::Joining;
                true
            }
            Some(state) => {
                *state = RoomState::Queued;
                false
            }
            None => {
                debug!("[ROOMS] {} left", topic_id);
                false
            }
        }
    }

    pub fn state(&self, topic_id: &str) -> Option<RoomState> {
        self.rooms.get(topic_id).copied()
    }

    pub fn is_tracked(&self, topic_id: &str) -> bool {
        self.rooms.contains_key(topic_id)
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn topics(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_while_offline_queues_once() {
        let mut rooms = RoomRegistry::new();

        assert_eq!(rooms.join("crop_1"), JoinAction::Queued);
        assert_eq!(rooms.join("crop_1"), JoinAction::AlreadyJoined);
        assert_eq!(rooms.state("crop_1"), Some(RoomState::Queued));

        assert_eq!(rooms.on_connected(), vec!["crop_1".to_string()]);
        assert_eq!(rooms.state("crop_1"), Some(RoomState::Joining));
    }

    #[test]
    fn test_join_while_online_sends_immediately() {
        let mut rooms = RoomRegistry::new();
        rooms.on_connected();

        assert_eq!(rooms.join("crop_1"), JoinAction::Send);
        assert_eq!(rooms.join("crop_1"), JoinAction::AlreadyJoined);
        assert!(rooms.confirm_joined("crop_1"));
        assert_eq!(rooms.state("crop_1"), Some(RoomState::Joined));
    }

    #[test]
    fn test_leave_queued_cancels_without_message() {
        let mut rooms = RoomRegistry::new();
        rooms.join("crop_1");

        assert_eq!(rooms.leave("crop_1"), LeaveAction::Cancelled);
        assert!(rooms.on_connected().is_empty());
        assert_eq!(rooms.leave("crop_1"), LeaveAction::NotJoined);
    }

    #[test]
    fn test_leave_joined_sends() {
        let mut rooms = RoomRegistry::new();
        rooms.on_connected();
        rooms.join("crop_1");
        rooms.confirm_joined("crop_1");

        assert_eq!(rooms.leave("crop_1"), LeaveAction::Send);
        assert!(!rooms.is_tracked("crop_1"));
        assert!(!rooms.confirm_joined("crop_1"));
    }

    #[test]
    fn test_reconnect_rejoins_every_topic_once() {
        let mut rooms = RoomRegistry::new();
        rooms.on_connected();
        rooms.join("crop_b");
        rooms.join("crop_a");
        rooms.confirm_joined("crop_a");

        rooms.on_disconnected();
        assert!(!rooms.is_online());
        assert_eq!(rooms.state("crop_a"), Some(RoomState::Queued));
        // Joining an already tracked topic while offline adds nothing
        assert_eq!(rooms.join("crop_a"), JoinAction::AlreadyJoined);

        let rejoin = rooms.on_connected();
        assert_eq!(rejoin, vec!["crop_a".to_string(), "crop_b".to_string()]);
    }

    #[test]
    fn test_requeue_and_server_left() {
        let mut rooms = RoomRegistry::new();
        rooms.on_connected();
        rooms.join("crop_1");

        rooms.requeue("crop_1");
        assert_eq!(rooms.state("crop_1"), Some(RoomState::Queued));

        rooms.confirm_joined("crop_1");
        assert!(rooms.confirm_left("crop_1"));
        assert_eq!(rooms.state("crop_1"), Some(RoomState::Joining));
        assert!(!rooms.confirm_left("crop_9"));
    }

    #[test]
    fn test_server_left_while_offline_waits_for_connect() {
        let mut rooms = RoomRegistry::new();
        rooms.join("crop_1");

        assert!(!rooms.confirm_left("crop_1"));
        assert_eq!(rooms.state("crop_1"), Some(RoomState::Queued));
        assert_eq!(rooms.on_connected(), vec!["crop_1".to_string()]);
    }
}
