//! Detects a simulated user stuck repeating itself.

use crate::conversation::Turn;

/// Number of trailing user messages that must match for a loop.
pub const LOOP_DETECTION_WINDOW: usize = 3;

/// Transcripts shorter than this are never checked by the orchestrator.
pub const MIN_TURNS_FOR_LOOP: usize = 4;

/// True when the last [`LOOP_DETECTION_WINDOW`] user messages are byte-for-byte identical.
///
/// Messages that differ by even a single character do not count as a loop.
pub fn is_loop(turns: &[Turn]) -> bool {
    let user_messages: Vec<&str> = turns
        .iter()
        .filter(|turn| turn.is_user())
        .map(Turn::content)
        .collect();

    if user_messages.len() < LOOP_DETECTION_WINDOW {
        return false;
    }

    let window = &user_messages[user_messages.len() - LOOP_DETECTION_WINDOW..];
    window.iter().all(|message| *message == window[0])
}

/// The orchestrator's check: enough turns to bother, and a loop in them.
pub fn should_stop_for_loop(turns: &[Turn]) -> bool {
    turns.len() >= MIN_TURNS_FOR_LOOP && is_loop(turns)
}
