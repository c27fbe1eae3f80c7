//! Sentinel framing over captured pane text
//!
//! A command is wrapped between a start marker and a done marker carrying the
//! exit status. The pane offers no framing of its own, so completion is found
//! by scanning successive captures with [`FrameScanner`].

use base64::{engine::general_purpose, Engine as _};
use uuid::Uuid;

/// Prefix shared by every synthetic marker
pub const MARKER_PREFIX: &str = "__TA_";

const START_TAG: &str = "__TA_START_";
const DONE_TAG: &str = "__TA_DONE_";
const MARKER_SUFFIX: &str = "__";

/// Random marker pair for one submitted command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    token: String,
}

impl Sentinel {
    pub fn new() -> Self {
        Self {
            token: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Rebuild a sentinel from its persisted done marker
    pub fn from_done_marker(marker: &str) -> Option<Self> {
        let token = marker
            .trim()
            .strip_prefix(DONE_TAG)?
            .strip_suffix(MARKER_SUFFIX)?;
        if token.is_empty() || !token.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(Self {
            token: token.to_string(),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn start_marker(&self) -> String {
        format!("{}{}{}", START_TAG, self.token, MARKER_SUFFIX)
    }

    /// Done marker without the exit status; this is the persisted form
    pub fn done_marker(&self) -> String {
        format!("{}{}{}", DONE_TAG, self.token, MARKER_SUFFIX)
    }

    /// Shell script that prints the start marker, runs `command`, and prints
    /// the done marker followed by the exit status
    ///
    /// Markers are printed from split halves so the echoed script line never
    /// contains a full marker.
    pub fn wrap(&self, command: &str) -> String {
        let encoded = general_purpose::STANDARD.encode(command.as_bytes());
        format!(
            "printf '%s%s\\n' '{start}' '{token}{suffix}'; eval \"$(printf '%s' '{encoded}' | base64 -d)\"; printf '%s%s%s\\n' '{done}' '{token}{suffix}' \"$?\"",
            start = START_TAG,
            done = DONE_TAG,
            token = self.token,
            suffix = MARKER_SUFFIX,
            encoded = encoded,
        )
    }
}

impl Default for Sentinel {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a scan of the pane currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    AwaitingStart,
    Collecting { body_start: usize },
    Done {
        body_start: usize,
        body_end: usize,
        exit_code: i32,
    },
}

/// Incremental scanner for one sentinel
///
/// Each call to [`FrameScanner::feed`] only examines lines at or after the
/// last unterminated line of the previous buffer. A buffer that got shorter
/// than the last one seen restarts the scan from the top.
#[derive(Debug, Clone)]
pub struct FrameScanner {
    start_marker: String,
    done_marker: String,
    state: FrameState,
    cursor: usize,
    seen_len: usize,
}

impl FrameScanner {
    pub fn new(sentinel: &Sentinel) -> Self {
        Self {
            start_marker: sentinel.start_marker(),
            done_marker: sentinel.done_marker(),
            state: FrameState::AwaitingStart,
            cursor: 0,
            seen_len: 0,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, FrameState::Done { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            FrameState::Done { exit_code, .. } => Some(exit_code),
            _ => None,
        }
    }

    /// Advance over a fresh capture of the pane
    pub fn feed(&mut self, buffer: &str) -> FrameState {
        if buffer.len() < self.seen_len {
            self.state = FrameState::AwaitingStart;
            self.cursor = 0;
        }
        self.seen_len = buffer.len();

        if self.is_done() {
            return self.state;
        }

        let mut line_start = self.cursor.min(buffer.len());
        while line_start < buffer.len() {
            let Some(rest) = buffer.get(line_start..) else {
                break;
            };
            let (line, terminated) = match rest.find('\n') {
                Some(end) => (&rest[..end], true),
                None => (rest, false),
            };
            let next_line = line_start + line.len() + usize::from(terminated);

            if let Some((offset, exit_code)) = self.find_done(line) {
                let body_start = match self.state {
                    FrameState::Collecting { body_start } => body_start,
                    // The start marker scrolled away or was cleared
                    _ => 0,
                };
                self.state = FrameState::Done {
                    body_start: body_start.min(line_start + offset),
                    body_end: line_start + offset,
                    exit_code,
                };
                return self.state;
            }

            if self.state == FrameState::AwaitingStart
                && terminated
                && line.contains(&self.start_marker)
            {
                self.state = FrameState::Collecting {
                    body_start: next_line,
                };
            }

            if !terminated {
                break;
            }
            line_start = next_line;
        }

        self.cursor = line_start;
        self.state
    }

    /// Text between the markers: complete once done, partial while collecting
    pub fn body<'a>(&self, buffer: &'a str) -> Option<&'a str> {
        match self.state {
            FrameState::AwaitingStart => None,
            FrameState::Collecting { body_start } => buffer.get(body_start..),
            FrameState::Done {
                body_start,
                body_end,
                ..
            } => buffer.get(body_start..body_end),
        }
    }

    fn find_done(&self, line: &str) -> Option<(usize, i32)> {
        let mut search_from = 0;
        while let Some(found) = line.get(search_from..)?.find(&self.done_marker) {
            let index = search_from + found;
            let after = &line[index + self.done_marker.len()..];
            let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !digits.is_empty() {
                let exit_code = digits.parse().unwrap_or(i32::MAX);
                return Some((index, exit_code));
            }
            search_from = index + self.done_marker.len();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentinel() -> Sentinel {
        Sentinel {
            token: "abc123".to_string(),
        }
    }

    #[test]
    fn test_sentinel_markers() {
        let sentinel = sentinel();
        assert_eq!(sentinel.start_marker(), "__TA_START_abc123__");
        assert_eq!(sentinel.done_marker(), "__TA_DONE_abc123__");
        assert_eq!(
            Sentinel::from_done_marker("__TA_DONE_abc123__"),
            Some(sentinel)
        );
        assert_eq!(Sentinel::from_done_marker("__TA_START_abc123__"), None);
        assert_eq!(Sentinel::from_done_marker("__TA_DONE_a;b__"), None);
    }

    #[test]
    fn test_new_sentinels_are_unique() {
        assert_ne!(Sentinel::new(), Sentinel::new());
        assert_eq!(Sentinel::new().token().len(), 32);
    }

    #[test]
    fn test_wrapped_script_never_contains_full_markers() {
        let sentinel = sentinel();
        let script = sentinel.wrap("echo 'hi'");
        assert!(!script.contains(&sentinel.start_marker()));
        assert!(!script.contains(&sentinel.done_marker()));
        assert!(script.contains(&general_purpose::STANDARD.encode("echo 'hi'")));
        assert!(!script.contains('\n'));
    }

    #[test]
    fn test_scanner_finds_body_and_exit_code() {
        let sentinel = sentinel();
        let mut scanner = FrameScanner::new(&sentinel);
        let buffer = "user@sandbox:~$ printf ... '__TA_START_' 'abc123__'\n__TA_START_abc123__\nhi\nthere\n__TA_DONE_abc123__0\nuser@sandbox:~$\n";

        let state = scanner.feed(buffer);
        assert!(matches!(state, FrameState::Done { exit_code: 0, .. }));
        assert_eq!(scanner.body(buffer), Some("hi\nthere\n"));
        assert_eq!(scanner.exit_code(), Some(0));
    }

    #[test]
    fn test_scanner_progresses_incrementally() {
        let sentinel = sentinel();
        let mut scanner = FrameScanner::new(&sentinel);

        let first = "prompt\n";
        assert_eq!(scanner.feed(first), FrameState::AwaitingStart);

        let second = "prompt\n__TA_START_abc123__\npartial\n";
        assert!(matches!(scanner.feed(second), FrameState::Collecting { .. }));
        assert_eq!(scanner.body(second), Some("partial\n"));

        let third = "prompt\n__TA_START_abc123__\npartial\nmore\n__TA_DONE_abc123__2\n";
        assert!(matches!(scanner.feed(third), FrameState::Done { exit_code: 2, .. }));
        assert_eq!(scanner.body(third), Some("partial\nmore\n"));
    }

    #[test]
    fn test_scanner_requires_exit_digits() {
        let sentinel = sentinel();
        let mut scanner = FrameScanner::new(&sentinel);
        let buffer = "__TA_START_abc123__\nout\n__TA_DONE_abc123__\n";
        assert!(matches!(scanner.feed(buffer), FrameState::Collecting { .. }));
    }

    #[test]
    fn test_scanner_output_without_trailing_newline() {
        let sentinel = sentinel();
        let mut scanner = FrameScanner::new(&sentinel);
        let buffer = "__TA_START_abc123__\nhi__TA_DONE_abc123__0\n";
        scanner.feed(buffer);
        assert_eq!(scanner.body(buffer), Some("hi"));
    }

    #[test]
    fn test_scanner_done_without_start() {
        let sentinel = sentinel();
        let mut scanner = FrameScanner::new(&sentinel);
        let buffer = "late output\n__TA_DONE_abc123__130\n";
        assert!(matches!(
            scanner.feed(buffer),
            FrameState::Done {
                body_start: 0,
                exit_code: 130,
                ..
            }
        ));
        assert_eq!(scanner.body(buffer), Some("late output\n"));
    }

    #[test]
    fn test_scanner_resets_on_shorter_buffer() {
        let sentinel = sentinel();
        let mut scanner = FrameScanner::new(&sentinel);
        scanner.feed("line one\n__TA_START_abc123__\nlots of output here\n");
        assert!(matches!(scanner.state(), FrameState::Collecting { .. }));

        let cleared = "x\n";
        assert_eq!(scanner.feed(cleared), FrameState::AwaitingStart);
    }

    #[test]
    fn test_scanner_ignores_other_tokens() {
        let sentinel = sentinel();
        let mut scanner = FrameScanner::new(&sentinel);
        let buffer = "__TA_START_abc123__\n__TA_DONE_other__0\n";
        assert!(matches!(scanner.feed(buffer), FrameState::Collecting { .. }));
    }
}
