use super::message::MessageId;

/// Tracks which message the view must reveal after a transcript mutation.
///
/// Every append or delta requests the tail, so the newest message is always
/// the visible one once the view applies the pending scroll.
#[derive(Debug, Default)]
pub struct ScrollManager {
    pending_scroll_to: Option<MessageId>,
    last_revealed: Option<MessageId>,
}

impl ScrollManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_scroll_to_bottom(&mut self, latest: MessageId) {
        self.pending_scroll_to = Some(latest);
    }

    pub fn has_pending_scroll(&self) -> bool {
        self.pending_scroll_to.is_some()
    }

    /// Consumes the pending request and returns the message to bring into view.
    pub fn apply_pending_scroll(&mut self) -> Option<MessageId> {
        let target = self.pending_scroll_to.take()?;
        self.last_revealed = Some(target);
        Some(target)
    }

    pub fn last_revealed(&self) -> Option<MessageId> {
        self.last_revealed
    }
}
