use std::time::Duration;

use shared::protocol::TypingEventKind;
use tokio::time::Instant;

/// Derives outgoing start/stop typing signals from composer text changes.
///
/// A `Stop` is only ever produced while a `Start` is outstanding.
#[derive(Debug, Clone)]
pub struct TypingCoordinator {
    debounce: Duration,
    idle_timeout: Duration,
    last_started: Option<Instant>,
    last_keystroke: Option<Instant>,
}

impl TypingCoordinator {
    pub fn new(debounce: Duration, idle_timeout: Duration) -> Self {
        Self {
            debounce,
            idle_timeout,
            last_started: None,
            last_keystroke: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.last_started.is_some()
    }

    pub fn on_text_changed(&mut self, text: &str, now: Instant) -> Option<TypingEventKind> {
        if text.trim().is_empty() {
            return self.stop();
        }

        self.last_keystroke = Some(now);
        match self.last_started {
            Some(started) if now.saturating_duration_since(started) < self.debounce => None,
            _ => {
                self.last_started = Some(now);
                Some(TypingEventKind::Start)
            }
        }
    }

    /// Emits `Stop` once the idle timeout has passed since the last keystroke.
    pub fn on_idle_tick(&mut self, now: Instant) -> Option<TypingEventKind> {
        let last = self.last_keystroke?;
        if now.saturating_duration_since(last) >= self.idle_timeout {
            self.stop()
        } else {
            None
        }
    }

    pub fn stop(&mut self) -> Option<TypingEventKind> {
        self.last_keystroke = None;
        self.last_started
            .take()
            .map(|_| TypingEventKind::Stop)
    }

    /// When the next idle check is due, if typing is in progress.
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.last_started?;
        self.last_keystroke.map(|last| last + self.idle_timeout)
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
