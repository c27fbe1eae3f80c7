//! Output cleaning and delta computation for captured pane text

use crate::framing::MARKER_PREFIX;
use regex::Regex;

/// Returned in place of an empty delta
pub const NO_NEW_OUTPUT: &str = "no new output";

/// Commands the manager types into a fresh session itself
const SETUP_COMMANDS: &[&str] = &["set +H", "clear"];

const BARE_PROMPT: &str = r"^\s*(?:\([^)]*\)\s*)?(?:[\w.\-]+@[\w.\-]+(?::\S*)?\s?[$#%>]|[\w.\-]+-[\d.]+[$#]|[$#>%]|>>>)\s*$";
const PROMPT_PREFIX: &str = r"^\s*(?:\([^)]*\)\s*)?(?:[\w.\-]+@[\w.\-]+(?::\S*)?\s?[$#%>]|[\w.\-]+-[\d.]+[$#]|[$#])\s+(\S.*)$";

/// Strips markers, prompts and setup noise from captured text
#[derive(Debug, Clone)]
pub struct OutputCleaner {
    bare_prompt: Regex,
    prompt_prefix: Regex,
}

impl OutputCleaner {
    pub fn new() -> crate::Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                crate::TerminalError::Internal(format!("Invalid prompt pattern: {}", e))
            })
        };
        Ok(Self {
            bare_prompt: compile(BARE_PROMPT)?,
            prompt_prefix: compile(PROMPT_PREFIX)?,
        })
    }

    /// Command text following a shell prompt, if the line starts with one
    fn command_after_prompt<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.prompt_prefix
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
    }

    fn is_noise(&self, line: &str) -> bool {
        if line.contains(MARKER_PREFIX) || self.bare_prompt.is_match(line) {
            return true;
        }
        let command = self.command_after_prompt(line).unwrap_or(line.trim());
        SETUP_COMMANDS.contains(&command)
    }

    /// Clean a raw capture down to the genuine command output
    ///
    /// Adjacent copies of the same command echo collapse into one line, and
    /// the prompt-prefixed copy wins over a bare one.
    pub fn clean(&self, raw: &str) -> String {
        let mut kept: Vec<(String, Option<String>)> = Vec::new();

        for raw_line in raw.split('\n') {
            let line = raw_line.replace('\r', "");
            let line = line.trim_end();
            if self.is_noise(line) {
                continue;
            }

            let echo = self.command_after_prompt(line).map(str::to_string);
            if let Some((prev_line, prev_echo)) = kept.last_mut() {
                let key = echo.as_deref().unwrap_or(line.trim());
                let prev_key = prev_echo.as_deref().unwrap_or(prev_line.trim());
                if !key.is_empty() && key == prev_key && (echo.is_some() || prev_echo.is_some()) {
                    if prev_echo.is_none() {
                        *prev_line = line.to_string();
                        *prev_echo = echo;
                    }
                    continue;
                }
            }
            kept.push((line.to_string(), echo));
        }

        let lines: Vec<&str> = kept.iter().map(|(line, _)| line.as_str()).collect();
        let first = lines.iter().position(|l| !l.trim().is_empty());
        let last = lines.iter().rposition(|l| !l.trim().is_empty());
        match (first, last) {
            (Some(first), Some(last)) => lines[first..=last].join("\n"),
            _ => String::new(),
        }
    }

    /// Cleaned text added since `baseline`, or [`NO_NEW_OUTPUT`]
    pub fn render_delta(&self, baseline: &str, captured: &str) -> String {
        let cleaned = self.clean(delta_since(baseline, captured));
        if cleaned.is_empty() {
            NO_NEW_OUTPUT.to_string()
        } else {
            cleaned
        }
    }
}

/// Portion of `captured` that was not already in `baseline`
///
/// The final baseline line is usually a prompt that the next keystrokes
/// extend, so a capture that only diverges inside that line still counts as
/// continuing the baseline.
pub fn delta_since<'a>(baseline: &str, captured: &'a str) -> &'a str {
    if let Some(rest) = captured.strip_prefix(baseline) {
        return rest;
    }

    let without_last_line = baseline.trim_end_matches('\n');
    let stable = match without_last_line.rfind('\n') {
        Some(index) => &baseline[..=index],
        None => "",
    };
    if let Some(rest) = captured.strip_prefix(stable) {
        return rest;
    }

    let mut start = baseline.len().min(captured.len());
    while !captured.is_char_boundary(start) {
        start -= 1;
    }
    &captured[start..]
}
