//! Read-side chat view
//!
//! Events impose no cross-author order; the displayable log is derived at
//! read time by walking the store in `created_at` order and joining reactions
//! onto their targets by event id. Reactions whose target has not arrived are
//! retained and join once it does.

use tracing::trace;
use weft_core::codec::EventCodec;
use weft_core::types::{DeviceId, EventId, EventPayload, FileAttachmentRef};

use crate::store::{EventStore, StoreError};

/// One rendered reaction on a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactionView {
    pub emoji: String,
    pub author: DeviceId,
}

/// A message with its joined reactions.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatEntry {
    pub event_id: EventId,
    pub author: DeviceId,
    pub content: String,
    pub timestamp: i64,
    pub attachments: Vec<FileAttachmentRef>,
    pub reactions: Vec<ReactionView>,
}

/// The joined log plus reactions still waiting for their target.
#[derive(Clone, Debug, Default)]
pub struct Timeline {
    pub entries: Vec<ChatEntry>,
    pub pending_reactions: Vec<(EventId, ReactionView)>,
}

/// Decrypt and join the whole log. Records that fail decode (or are not chat
/// payloads) are skipped without being dropped from the store.
pub fn build(store: &dyn EventStore, codec: &EventCodec) -> Result<Timeline, StoreError> {
    let mut timeline = Timeline::default();
    let mut reactions = Vec::new();

    for record in store.iter_by_created_at() {
        let record = record?;
        let decoded = match codec.decode(record.author, &record.ciphertext, record.signature.as_deref())
        {
            Ok(decoded) => decoded,
            Err(e) => {
                trace!(event_id = %record.event_id, "skipping undecodable record: {e}");
                continue;
            }
        };
        match decoded.payload {
            EventPayload::Message(m) => timeline.entries.push(ChatEntry {
                event_id: record.event_id,
                author: m.author,
                content: m.content,
                timestamp: m.timestamp,
                attachments: m.attachments,
                reactions: Vec::new(),
            }),
            EventPayload::Reaction(r) => reactions.push(r),
            // File chunks and unknown variants are not displayable.
            EventPayload::FileChunk(_) | EventPayload::Unknown { .. } => {}
        }
    }

    // Apply reactions in created_at order so add/remove toggles resolve the
    // way the authors observed them.
    for reaction in reactions {
        let view = ReactionView {
            emoji: reaction.emoji.clone(),
            author: reaction.author,
        };
        match timeline
            .entries
            .iter_mut()
            .find(|e| e.event_id == reaction.target)
        {
            Some(entry) => {
                if reaction.remove {
                    entry.reactions.retain(|r| *r != view);
                } else if !entry.reactions.contains(&view) {
                    entry.reactions.push(view);
                }
            }
            None => timeline.pending_reactions.push((reaction.target, view)),
        }
    }

    Ok(timeline)
}
