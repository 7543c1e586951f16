use firechat_storage::{MessageRecord, MessageSet, Participants, UserId};

/// Messages of the conversation between `current` and `peer`, oldest first.
///
/// Snapshots arrive newest first; the result is re-sorted by `(created_at, seq)` so rendering
/// order does not depend on delivery order. A conversation with oneself is always empty.
pub fn filter_conversation(
    set: &MessageSet,
    current: UserId,
    peer: UserId,
) -> Vec<MessageRecord> {
    let Ok(pair) = Participants::new(current, peer) else {
        return Vec::new();
    };

    let mut messages = set
        .messages
        .iter()
        .filter(|message| message.participants == pair)
        .cloned()
        .collect::<Vec<_>>();
    messages.sort_by_key(|message| (message.created_at_unix_millis, message.seq));
    messages
}

/// Distinct counterparts of `current` across a snapshot, in first-seen order.
pub fn counterparts(set: &MessageSet, current: UserId) -> Vec<UserId> {
    let mut seen = Vec::new();
    for other in set
        .messages
        .iter()
        .filter_map(|message| message.participants.other(current))
    {
        if !seen.contains(&other) {
            seen.push(other);
        }
    }
    seen
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outgoing,
    Incoming,
}

pub fn direction(message: &MessageRecord, current: UserId) -> Direction {
    if message.sender_id == current {
        Direction::Outgoing
    } else {
        Direction::Incoming
    }
}
