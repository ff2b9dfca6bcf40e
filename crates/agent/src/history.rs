//! History windowing for outgoing requests.

use pocketcode_core::message::Message;

/// Default number of trailing messages sent to single-round models.
pub const DEFAULT_HISTORY_WINDOW: usize = 12;

/// The history to send with a request. Single-round models get the last
/// `window` messages; multi-turn models get everything.
pub fn window_history(history: &[Message], single_round: bool, window: usize) -> Vec<Message> {
    if !single_round || history.len() <= window {
        return history.to_vec();
    }
    history[history.len() - window..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("q{i}"))
                } else {
                    Message::assistant(format!("a{i}"))
                }
            })
            .collect()
    }

    #[test]
    fn single_round_keeps_last_k() {
        let h = history(30);
        let windowed = window_history(&h, true, DEFAULT_HISTORY_WINDOW);
        assert_eq!(windowed.len(), 12);
        assert_eq!(windowed[0].content, "q18");
        assert_eq!(windowed[11].content, "a29");
    }

    #[test]
    fn multi_turn_keeps_everything() {
        let h = history(30);
        assert_eq!(window_history(&h, false, DEFAULT_HISTORY_WINDOW).len(), 30);
    }

    #[test]
    fn short_history_is_untouched() {
        let h = history(5);
        assert_eq!(window_history(&h, true, 12).len(), 5);
        assert!(window_history(&[], true, 12).is_empty());
    }
}
