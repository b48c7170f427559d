//! Activity detection from terminal output.
//!
//! Output is scanned, with escape sequences stripped, for markers printed by
//! known interactive applications. A recognised marker becomes the session's
//! specific status until it stops appearing for [`ACTIVITY_WINDOW_MS`].

use std::sync::LazyLock;

use regex::Regex;

use super::model::{SpecificStatus, ACTIVITY_WINDOW_MS};

/// Bytes of trailing output kept so markers split across reads still match.
const TAIL_BYTES: usize = 512;

struct Patterns {
    ansi: Regex,
    claude: Regex,
}

static PATTERNS: LazyLock<Option<Patterns>> = LazyLock::new(|| {
    let compiled = Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][0-9A-B]")
        .and_then(|ansi| {
            Regex::new(
                r"[✻✽✶✳✢·*]\s+(?P<verb>[A-Z][a-z]+)(?:…|\.\.\.)?\s*\((?P<secs>\d+)s\s*[·•][^)]*esc to interrupt\)",
            )
            .map(|claude| Patterns { ansi, claude })
        });
    match compiled {
        Ok(p) => Some(p),
        Err(e) => {
            tracing::error!(error = %e, "Activity patterns failed to compile, detection disabled");
            None
        }
    }
});

/// Remove ANSI escape sequences from `text`.
pub fn strip_ansi(text: &str) -> String {
    match PATTERNS.as_ref() {
        Some(p) => p.ansi.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Look for a known application marker in already-stripped text.
///
/// The last match wins, since the newest spinner line is the current one.
pub fn detect(text: &str) -> Option<SpecificStatus> {
    let patterns = PATTERNS.as_ref()?;
    let caps = patterns.claude.captures_iter(text).last()?;
    Some(SpecificStatus {
        app: "claude".to_string(),
        status: format!("{} ({}s)", &caps["verb"], &caps["secs"]),
    })
}

/// Per-session detector state.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    tail: String,
    current: Option<SpecificStatus>,
    last_match_at: u64,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one output chunk observed at `now` (Unix millis) and return the
    /// specific status that should be shown.
    pub fn observe(&mut self, chunk: &[u8], now: u64) -> Option<SpecificStatus> {
        self.tail.push_str(&String::from_utf8_lossy(chunk));
        if self.tail.len() > TAIL_BYTES {
            let mut cut = self.tail.len() - TAIL_BYTES;
            while !self.tail.is_char_boundary(cut) {
                cut += 1;
            }
            self.tail.drain(..cut);
        }

        if let Some(status) = detect(&strip_ansi(&self.tail)) {
            self.current = Some(status);
            self.last_match_at = now;
        } else if now.saturating_sub(self.last_match_at) >= ACTIVITY_WINDOW_MS {
            self.current = None;
        }
        self.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        let raw = "\x1b[1;32mgreen\x1b[0m \x1b]0;title\x07text";
        assert_eq!(strip_ansi(raw), "green text");
    }

    #[test]
    fn test_detect_claude_spinner() {
        let line = "✻ Thinking… (12s · ↑ 1.2k tokens · esc to interrupt)";
        let status = detect(line).unwrap();
        assert_eq!(status.app, "claude");
        assert_eq!(status.status, "Thinking (12s)");
    }

    #[test]
    fn test_detect_last_match_wins() {
        let text = "✻ Thinking… (1s · esc to interrupt)\r\n✶ Pondering… (2s · esc to interrupt)";
        assert_eq!(detect(text).unwrap().status, "Pondering (2s)");
    }

    #[test]
    fn test_detect_plain_output() {
        assert!(detect("hello world\r\n$ ").is_none());
    }

    #[test]
    fn test_tracker_matches_across_chunks_and_colors() {
        let mut tracker = ActivityTracker::new();
        assert!(tracker.observe(b"\x1b[33m\xe2\x9c\xbb Work", 1_000).is_none());
        let status = tracker
            .observe("ing… (3s · esc to interrupt)\x1b[0m".as_bytes(), 1_100)
            .unwrap();
        assert_eq!(status.status, "Working (3s)");
    }

    #[test]
    fn test_tracker_expires_status() {
        let mut tracker = ActivityTracker::new();
        tracker.observe("✻ Thinking… (1s · esc to interrupt)".as_bytes(), 1_000);

        // The marker is still inside the retained tail.
        assert!(tracker.observe(b"x", 2_000).is_some());

        let filler = vec![b'.'; TAIL_BYTES * 2];
        assert!(tracker.observe(&filler, 2_500).is_some());
        assert!(tracker
            .observe(&filler, 2_000 + ACTIVITY_WINDOW_MS)
            .is_none());
    }
}
