//! Translation of caller input into multiplexer key sequences
//!
//! Only a fixed set of symbolic keys and a few modifier forms become raw key
//! names. Everything else is literal text, which is pasted through a buffer
//! instead of being placed on a command line.

/// How a `send` input reaches the pane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyInput {
    /// Key names passed to `send-keys` as-is
    Keys(Vec<String>),
    /// Literal text for the paste buffer
    Text(String),
}

impl KeyInput {
    /// Whether an Enter key should follow the pasted text
    pub fn needs_enter(&self) -> bool {
        match self {
            KeyInput::Keys(_) => false,
            KeyInput::Text(text) => !text.ends_with('\n'),
        }
    }
}

fn named_key(name: &str) -> Option<String> {
    let key = match name.to_ascii_lowercase().as_str() {
        "enter" | "return" => "Enter",
        "tab" => "Tab",
        "escape" | "esc" => "Escape",
        "backspace" | "bspace" => "BSpace",
        "delete" | "del" => "DC",
        "up" => "Up",
        "down" => "Down",
        "left" => "Left",
        "right" => "Right",
        "home" => "Home",
        "end" => "End",
        "pageup" | "pgup" => "PPage",
        "pagedown" | "pgdn" => "NPage",
        "space" => "Space",
        "insert" => "IC",
        other => {
            let number: u8 = other.strip_prefix('f')?.parse().ok()?;
            if (1..=12).contains(&number) {
                return Some(format!("F{}", number));
            }
            return None;
        }
    };
    Some(key.to_string())
}

/// A single ASCII letter or digit
fn single_alnum(value: &str) -> Option<char> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphanumeric() => Some(c),
        _ => None,
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        value.get(prefix.len()..)
    } else {
        None
    }
}

fn modifier_key(input: &str) -> Option<String> {
    for prefix in ["ctrl+shift+", "control+shift+", "c-s-"] {
        if let Some(rest) = strip_prefix_ignore_case(input, prefix) {
            return single_alnum(rest).map(|c| format!("C-S-{}", c.to_ascii_lowercase()));
        }
    }
    for prefix in ["ctrl+", "control+", "c-", "^"] {
        if let Some(rest) = strip_prefix_ignore_case(input, prefix) {
            return single_alnum(rest).map(|c| format!("C-{}", c.to_ascii_lowercase()));
        }
    }
    for prefix in ["alt+", "meta+", "m-"] {
        if let Some(rest) = strip_prefix_ignore_case(input, prefix) {
            // Alt keeps case: M-x and M-X are different keys
            return single_alnum(rest).map(|c| format!("M-{}", c));
        }
    }
    None
}

/// Classify a `send` input as symbolic keys or literal text
pub fn translate_input(input: &str) -> KeyInput {
    let trimmed = input.trim();
    if trimmed.is_empty() && !input.contains('\n') {
        return KeyInput::Keys(vec!["Enter".to_string()]);
    }

    if let Some(key) = named_key(trimmed).or_else(|| modifier_key(trimmed)) {
        return KeyInput::Keys(vec![key]);
    }

    KeyInput::Text(input.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(k: &str) -> KeyInput {
        KeyInput::Keys(vec![k.to_string()])
    }

    #[test]
    fn test_named_keys() {
        assert_eq!(translate_input("Enter"), keys("Enter"));
        assert_eq!(translate_input("return"), keys("Enter"));
        assert_eq!(translate_input("ESC"), keys("Escape"));
        assert_eq!(translate_input("Backspace"), keys("BSpace"));
        assert_eq!(translate_input("PageDown"), keys("NPage"));
        assert_eq!(translate_input("f5"), keys("F5"));
        assert_eq!(translate_input(" Up "), keys("Up"));
    }

    #[test]
    fn test_out_of_range_function_key_is_text() {
        assert_eq!(translate_input("F13"), KeyInput::Text("F13".to_string()));
        assert_eq!(translate_input("f"), KeyInput::Text("f".to_string()));
    }

    #[test]
    fn test_ctrl_forms() {
        assert_eq!(translate_input("Ctrl+C"), keys("C-c"));
        assert_eq!(translate_input("C-c"), keys("C-c"));
        assert_eq!(translate_input("^D"), keys("C-d"));
        assert_eq!(translate_input("ctrl+z"), keys("C-z"));
        assert_eq!(translate_input("Ctrl+Shift+T"), keys("C-S-t"));
    }

    #[test]
    fn test_alt_forms() {
        assert_eq!(translate_input("Alt+x"), keys("M-x"));
        assert_eq!(translate_input("M-b"), keys("M-b"));
        assert_eq!(translate_input("Alt+X"), keys("M-X"));
    }

    #[test]
    fn test_injection_attempts_become_text() {
        let attempts = ["Ctrl+;rm -rf /", "C-$(id)", "Enter; reboot", "Alt+xx", "^'"];
        for attempt in attempts {
            assert_eq!(translate_input(attempt), KeyInput::Text(attempt.to_string()));
        }
    }

    #[test]
    fn test_text_enter_rules() {
        let text = translate_input("ls -la");
        assert_eq!(text, KeyInput::Text("ls -la".to_string()));
        assert!(text.needs_enter());

        let terminated = translate_input("yes\n");
        assert!(!terminated.needs_enter());
        assert!(!translate_input("C-c").needs_enter());
    }

    #[test]
    fn test_empty_input_sends_enter() {
        assert_eq!(translate_input(""), keys("Enter"));
        assert_eq!(translate_input("\n"), KeyInput::Text("\n".to_string()));
    }
}
