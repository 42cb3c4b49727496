//! The collaborators a conversation relies on but doesn't own.

use std::io;

use async_trait::async_trait;
use tubes_proto::messages::Participant;

/// The peer messaging session a conversation's negotiation messages travel over.
///
/// Payloads are opaque to the session. Requests and broadcasts received from the session are
/// handed to [`Conversation::handle_request`](crate::Conversation::handle_request) and
/// [`Conversation::handle_broadcast`](crate::Conversation::handle_broadcast).
#[async_trait(?Send)]
pub trait MessagingSession {
    /// Sends a request to the remote peer of a two-party conversation and waits for its reply.
    async fn send_request(&self, payload: Vec<u8>) -> io::Result<Vec<u8>>;

    /// Sends a payload to every member of a group conversation.
    async fn send_broadcast(&self, payload: Vec<u8>) -> io::Result<()>;
}

/// Who is in a group conversation.
///
/// Joins and departures are reported through
/// [`Conversation::member_joined`](crate::Conversation::member_joined) and
/// [`Conversation::member_left`](crate::Conversation::member_left).
pub trait GroupMembership {
    fn current_members(&self) -> Vec<Participant>;

    fn is_member(&self, participant: &Participant) -> bool {
        self.current_members().contains(participant)
    }
}
