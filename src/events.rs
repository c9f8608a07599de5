//! Live vote feed pushed to leaderboard clients.

use serde::Serialize;
use tokio::sync::broadcast;

/// Events kept for slow subscribers before they start skipping.
const CHANNEL_CAPACITY: usize = 256;

/// Name of the server-sent event carrying a [`VoteEvent`].
pub const NEW_VOTE_EVENT: &str = "new_vote";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteEvent {
    pub player_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub total_votes: i64,
    pub voted_at: String,
}

#[derive(Clone)]
pub struct VoteEvents {
    sender: broadcast::Sender<VoteEvent>,
}

impl VoteEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Fan the event out to every connected client. Having none is fine.
    pub fn publish(&self, event: VoteEvent) {
        match self.sender.send(event) {
            Ok(n) => log::debug!("new_vote delivered to {} subscribers", n),
            Err(_) => log::debug!("new_vote dropped: no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoteEvent> {
        self.sender.subscribe()
    }
}

impl Default for VoteEvents {
    fn default() -> Self {
        Self::new()
    }
}
