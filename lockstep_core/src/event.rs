// Notifications a session raises for its embedder (UI, logs, tests).
//
// Sessions queue events while handling messages and ticks; the embedder
// drains them with `take_events()` whenever convenient. Nothing in the
// session depends on events being consumed.

use lockstep_protocol::message::ParticipantInfo;
use lockstep_protocol::types::{CallbackId, ErrorCode, ParticipantId};

use crate::pause::PauseTransition;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// The applied pause mask changed.
    PauseChanged(PauseTransition),
    /// A participant became active.
    ParticipantJoined(ParticipantInfo),
    /// An active participant left.
    ParticipantLeft {
        id: ParticipantId,
        name: String,
        reason: Option<ErrorCode>,
    },
    /// A command issued here with a callback was executed at `tick`.
    CommandCompleted { tick: u64, callback: CallbackId },
    /// The host ended the session.
    SessionEnded,
}
