//! In-memory sandbox for tests
//!
//! [`FakeSandbox`] interprets the small shell dialect the manager emits
//! (quoted words, pipes, `&&`, `||`, `;`) and emulates enough of tmux to
//! drive sessions end to end: panes with scrollback, a prompt, paste
//! buffers, session environments and foreground process reporting. Commands
//! submitted inside a pane are answered from scripted [`FakeCommand`]s.
//!
//! Time is measured in ticks. Every `capture-pane` and `display-message`
//! advances running commands by one tick.

use crate::sandbox::{RunOptions, RunOutput, Sandbox};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Prompt rendered on idle panes
pub const FAKE_PROMPT: &str = "user@sandbox:~$";

const FAKE_BINARY: &str = "/usr/bin/tmux";
const FAKE_SHELL: &str = "bash";
const KEY_NAMES: &[&str] = &[
    "Enter", "Tab", "Escape", "BSpace", "DC", "Up", "Down", "Left", "Right", "Home", "End",
    "PPage", "NPage", "Space", "IC",
];
const PACKAGE_MANAGER_NAMES: &[&str] = &["apt-get", "apk", "dnf", "yum", "pacman", "zypper", "brew"];

/// Scripted behaviour of a command typed into a fake pane
#[derive(Debug, Clone, PartialEq)]
pub struct FakeCommand {
    pub output: Vec<String>,
    pub exit_code: i32,
    /// Ticks before the command finishes; output lines trickle out one per tick
    pub ticks: u32,
    /// Name reported as the pane's foreground process while running
    pub program: Option<String>,
}

impl FakeCommand {
    pub fn new<I, S>(output: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            output: output.into_iter().map(Into::into).collect(),
            exit_code: 0,
            ticks: 0,
            program: None,
        }
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn ticks(mut self, ticks: u32) -> Self {
        self.ticks = ticks;
        self
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }
}

#[derive(Debug)]
struct RunningCommand {
    remaining: VecDeque<String>,
    ticks_left: u32,
    exit_code: i32,
    done_marker: Option<String>,
    program: String,
}

#[derive(Debug)]
struct FakePane {
    lines: Vec<String>,
    input: String,
    env: HashMap<String, String>,
    pane_pid: u32,
    history_limit: Option<u32>,
    running: Option<RunningCommand>,
}

impl FakePane {
    fn new(pane_pid: u32, history_limit: Option<u32>) -> Self {
        Self {
            lines: Vec::new(),
            input: String::new(),
            env: HashMap::new(),
            pane_pid,
            history_limit,
            running: None,
        }
    }

    fn render(&self) -> String {
        let mut text = String::new();
        for line in &self.lines {
            text.push_str(line);
            text.push('\n');
        }
        if self.running.is_some() {
            if !self.input.is_empty() {
                text.push_str(&self.input);
                text.push('\n');
            }
        } else {
            text.push_str(FAKE_PROMPT);
            text.push(' ');
            text.push_str(&self.input);
            text.push('\n');
        }
        text
    }

    fn finish(&mut self) {
        if let Some(running) = self.running.take() {
            self.lines.extend(running.remaining);
            if let Some(marker) = running.done_marker {
                self.lines.push(format!("{}{}", marker, running.exit_code));
            }
        }
    }

    fn tick(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if let Some(line) = running.remaining.pop_front() {
            self.lines.push(line);
        }
        running.ticks_left = running.ticks_left.saturating_sub(1);
        if running.ticks_left == 0 {
            self.finish();
        }
    }

    fn interrupt(&mut self) {
        match self.running.take() {
            // The shell aborts the whole command line, so no done marker follows
            Some(_) => self.lines.push("^C".to_string()),
            None => {
                self.lines.push(format!("{} {}^C", FAKE_PROMPT, self.input));
                self.input.clear();
            }
        }
    }
}

#[derive(Debug)]
struct FakeState {
    backend_installed: bool,
    installable_with: Option<String>,
    sessions: HashMap<String, FakePane>,
    buffers: HashMap<String, String>,
    commands: HashMap<String, FakeCommand>,
    submissions: HashMap<String, usize>,
    history_limit: Option<u32>,
    server_started: bool,
    blank_runs: usize,
    create_races: bool,
    install_attempts: Vec<String>,
    last_install_user: Option<String>,
    run_log: Vec<String>,
    next_pid: u32,
}

/// Scriptable in-memory [`Sandbox`] with a tmux emulation
#[derive(Debug)]
pub struct FakeSandbox {
    state: Mutex<FakeState>,
    streaming: bool,
}

struct Outcome {
    stdout: String,
    stderr: String,
    code: i32,
}

impl Outcome {
    fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            code: 0,
        }
    }

    fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            code,
        }
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Pipe,
    And,
    Or,
    Semi,
}

fn tokenize(line: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars().peekable();

    let flush = |tokens: &mut Vec<Token>, word: &mut String, in_word: &mut bool| {
        if *in_word {
            tokens.push(Token::Word(std::mem::take(word)));
            *in_word = false;
        }
    };

    while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => flush(&mut tokens, &mut word, &mut in_word),
            '\'' => {
                in_word = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    word.push(c);
                }
            }
            '"' => {
                in_word = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(next) = chars.next() {
                                word.push(next);
                            }
                        }
                        other => word.push(other),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    word.push(next);
                }
            }
            '|' => {
                flush(&mut tokens, &mut word, &mut in_word);
                if chars.peek() == Some(&'|') {
                    chars.next();
                    tokens.push(Token::Or);
                } else {
                    tokens.push(Token::Pipe);
                }
            }
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                flush(&mut tokens, &mut word, &mut in_word);
                tokens.push(Token::And);
            }
            ';' => {
                flush(&mut tokens, &mut word, &mut in_word);
                tokens.push(Token::Semi);
            }
            other => {
                in_word = true;
                word.push(other);
            }
        }
    }
    flush(&mut tokens, &mut word, &mut in_word);
    tokens
}

fn is_redirection(word: &str) -> bool {
    let rest = word.trim_start_matches(|c: char| c.is_ascii_digit());
    rest.starts_with('>') || rest.starts_with('<')
}

/// `=name` and `=name:` targets both address the session `name`
fn target_name(target: &str) -> &str {
    target.trim_start_matches('=').trim_end_matches(':')
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Arguments left after dropping `-x` style flags and the value after `-t`/`-b`
fn positional(args: &[String], valued: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
            continue;
        }
        if valued.contains(&arg.as_str()) {
            skip = true;
            continue;
        }
        if arg.starts_with('-') && arg.len() > 1 {
            continue;
        }
        out.push(arg.clone());
    }
    out
}

impl FakeSandbox {
    /// A sandbox with tmux installed
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A sandbox where tmux is missing and no package manager exists
    pub fn without_backend() -> Self {
        Self::build(false)
    }

    fn build(installed: bool) -> Self {
        Self {
            state: Mutex::new(FakeState {
                backend_installed: installed,
                installable_with: None,
                sessions: HashMap::new(),
                buffers: HashMap::new(),
                commands: HashMap::new(),
                submissions: HashMap::new(),
                history_limit: None,
                server_started: false,
                blank_runs: 0,
                create_races: false,
                install_attempts: Vec::new(),
                last_install_user: None,
                run_log: Vec::new(),
                next_pid: 4000,
            }),
            streaming: false,
        }
    }

    /// Make `manager` available for installing tmux
    pub fn installable_with(self, manager: &str) -> Self {
        self.lock().installable_with = Some(manager.to_string());
        self
    }

    /// Report incremental output support
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Script the behaviour of a command typed into any pane
    pub fn with_command(self, command: &str, behaviour: FakeCommand) -> Self {
        self.add_command(command, behaviour);
        self
    }

    pub fn add_command(&self, command: &str, behaviour: FakeCommand) {
        self.lock().commands.insert(command.to_string(), behaviour);
    }

    /// Answer the next `count` runs with empty output, like a just-resumed sandbox
    pub fn blank_next_runs(&self, count: usize) {
        self.lock().blank_runs = count;
    }

    /// Make `new-session` create the session but report a duplicate, as when
    /// another caller won the race
    pub fn race_session_creation(&self) {
        self.lock().create_races = true;
    }

    /// Create a backend session out of band, as a previous process would have
    pub fn spawn_session(&self, name: &str) {
        let mut state = self.lock();
        state.next_pid += 1;
        let pid = state.next_pid;
        let limit = state.history_limit;
        state.sessions.insert(name.to_string(), FakePane::new(pid, limit));
    }

    /// Remove a backend session out of band
    pub fn destroy_session(&self, name: &str) {
        self.lock().sessions.remove(name);
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.lock().sessions.contains_key(name)
    }

    pub fn session_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().sessions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current pane text without advancing time
    pub fn pane_text(&self, name: &str) -> Option<String> {
        self.lock().sessions.get(name).map(FakePane::render)
    }

    pub fn env_value(&self, name: &str, key: &str) -> Option<String> {
        self.lock()
            .sessions
            .get(name)
            .and_then(|pane| pane.env.get(key).cloned())
    }

    /// How many times `command` was submitted in any pane
    pub fn submissions(&self, command: &str) -> usize {
        self.lock().submissions.get(command).copied().unwrap_or(0)
    }

    pub fn install_attempts(&self) -> Vec<String> {
        self.lock().install_attempts.clone()
    }

    pub fn last_install_user(&self) -> Option<String> {
        self.lock().last_install_user.clone()
    }

    /// Scrollback limit a session was created with, if one had been set
    pub fn session_history_limit(&self, name: &str) -> Option<u32> {
        self.lock()
            .sessions
            .get(name)
            .and_then(|pane| pane.history_limit)
    }

    /// Every command string passed to `run`
    pub fn run_log(&self) -> Vec<String> {
        self.lock().run_log.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn execute_line(&self, state: &mut FakeState, line: &str, options: &RunOptions) -> Outcome {
        let tokens = tokenize(line);
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut code = 0;
        let mut skip = false;
        let mut pipeline: Vec<Vec<String>> = vec![Vec::new()];

        let mut tokens = tokens.into_iter();
        loop {
            let token = match tokens.next() {
                Some(Token::Word(word)) => {
                    if let Some(current) = pipeline.last_mut() {
                        current.push(word);
                    }
                    continue;
                }
                Some(Token::Pipe) => {
                    pipeline.push(Vec::new());
                    continue;
                }
                other => other,
            };

            if !skip {
                let outcome = self.execute_pipeline(state, &pipeline, options);
                stdout.push_str(&outcome.stdout);
                stderr.push_str(&outcome.stderr);
                code = outcome.code;
            }
            pipeline = vec![Vec::new()];

            skip = match token {
                Some(Token::And) => code != 0,
                Some(Token::Or) => code == 0,
                Some(_) => false,
                None => break,
            };
        }

        Outcome {
            stdout,
            stderr,
            code,
        }
    }

    fn execute_pipeline(&self, state: &mut FakeState, pipeline: &[Vec<String>], options: &RunOptions) -> Outcome {
        let mut input = String::new();
        let mut last = Outcome::ok("");
        let mut stderr = String::new();
        for words in pipeline {
            let words: Vec<String> = words
                .iter()
                .filter(|w| !is_redirection(w))
                .skip_while(|w| w.contains('=') && !w.starts_with('-'))
                .cloned()
                .collect();
            if words.is_empty() {
                continue;
            }
            last = self.execute_command(state, &words, &input, options);
            stderr.push_str(&last.stderr);
            input = std::mem::take(&mut last.stdout);
        }
        Outcome {
            stdout: input,
            stderr,
            code: last.code,
        }
    }

    fn execute_command(&self, state: &mut FakeState, words: &[String], input: &str, options: &RunOptions) -> Outcome {
        let program = words[0].as_str();
        let args = &words[1..];

        if program.ends_with("tmux") {
            if !state.backend_installed {
                return Outcome::fail(127, format!("sh: {}: not found\n", program));
            }
            return self.tmux(state, args, input);
        }

        match program {
            "printf" => {
                if args.first().map(String::as_str) == Some("%s") {
                    Outcome::ok(args[1..].concat())
                } else {
                    Outcome::ok(args.first().cloned().unwrap_or_default())
                }
            }
            "echo" => Outcome::ok(format!("{}\n", args.join(" "))),
            "base64" => match general_purpose::STANDARD.decode(input.trim()) {
                Ok(bytes) => Outcome::ok(String::from_utf8_lossy(&bytes).to_string()),
                Err(_) => Outcome::fail(1, "base64: invalid input\n"),
            },
            "command" | "which" => {
                let name = args.iter().find(|a| !a.starts_with('-')).cloned().unwrap_or_default();
                if name == "tmux" && state.backend_installed {
                    Outcome::ok(format!("{}\n", FAKE_BINARY))
                } else if state.installable_with.as_deref() == Some(name.as_str()) {
                    Outcome::ok(format!("/usr/bin/{}\n", name))
                } else {
                    Outcome::fail(1, "")
                }
            }
            "test" => {
                let path = args.last().cloned().unwrap_or_default();
                if state.backend_installed && path == FAKE_BINARY {
                    Outcome::ok("")
                } else {
                    Outcome::fail(1, "")
                }
            }
            "pgrep" => {
                let pid: Option<u32> = flag_value(args, "-P").and_then(|p| p.parse().ok());
                let busy = state
                    .sessions
                    .values()
                    .any(|pane| Some(pane.pane_pid) == pid && pane.running.is_some());
                match pid {
                    Some(pid) if busy => Outcome::ok(format!("{}\n", pid + 1)),
                    _ => Outcome::fail(1, ""),
                }
            }
            "true" => Outcome::ok(""),
            "false" => Outcome::fail(1, ""),
            name if PACKAGE_MANAGER_NAMES.contains(&name) => {
                if state.installable_with.as_deref() != Some(name) {
                    return Outcome::fail(127, format!("sh: {}: not found\n", name));
                }
                let installs = args
                    .iter()
                    .any(|a| a == "install" || a == "add" || a == "-Sy");
                if installs {
                    state.install_attempts.push(name.to_string());
                    state.last_install_user = options.user.clone();
                    state.backend_installed = true;
                }
                Outcome::ok("")
            }
            other => Outcome::fail(127, format!("sh: {}: not found\n", other)),
        }
    }

    /// Run `;`-separated tmux commands in order, stopping at the first failure
    fn tmux(&self, state: &mut FakeState, args: &[String], input: &str) -> Outcome {
        state.server_started = false;
        let mut outcome = Outcome::ok("");
        for command in args.split(|arg| arg == ";") {
            let previous = outcome.stdout;
            outcome = self.tmux_command(state, command, input);
            outcome.stdout = previous + &outcome.stdout;
            if outcome.code != 0 {
                break;
            }
        }
        outcome
    }

    fn tmux_command(&self, state: &mut FakeState, args: &[String], input: &str) -> Outcome {
        let Some(subcommand) = args.first() else {
            return Outcome::fail(1, "usage: tmux command\n");
        };
        let rest = &args[1..];
        let target = flag_value(rest, "-t").map(target_name).unwrap_or_default().to_string();

        match subcommand.as_str() {
            "has-session" => {
                if state.sessions.contains_key(&target) {
                    Outcome::ok("")
                } else {
                    Outcome::fail(1, format!("can't find session: {}\n", target))
                }
            }
            "new-session" => {
                let name = flag_value(rest, "-s").unwrap_or_default().to_string();
                if state.sessions.contains_key(&name) {
                    return Outcome::fail(1, format!("duplicate session: {}\n", name));
                }
                state.next_pid += 1;
                let pid = state.next_pid;
                let limit = state.history_limit;
                state.sessions.insert(name.clone(), FakePane::new(pid, limit));
                if state.create_races {
                    state.create_races = false;
                    return Outcome::fail(1, format!("duplicate session: {}\n", name));
                }
                Outcome::ok("")
            }
            "start-server" => {
                state.server_started = true;
                Outcome::ok("")
            }
            "set-option" => {
                if state.sessions.is_empty() && !state.server_started {
                    return Outcome::fail(1, "no server running\n");
                }
                let values = positional(rest, &["-t"]);
                if values.first().map(String::as_str) == Some("history-limit") {
                    state.history_limit = values.get(1).and_then(|v| v.parse().ok());
                }
                Outcome::ok("")
            }
            "kill-session" => match state.sessions.remove(&target) {
                Some(_) => Outcome::ok(""),
                None => Outcome::fail(1, format!("can't find session: {}\n", target)),
            },
            "load-buffer" => {
                let name = flag_value(rest, "-b").unwrap_or_default().to_string();
                state.buffers.insert(name, input.to_string());
                Outcome::ok("")
            }
            "paste-buffer" => {
                let name = flag_value(rest, "-b").unwrap_or_default().to_string();
                let Some(text) = state.buffers.remove(&name) else {
                    return Outcome::fail(1, format!("no buffer {}\n", name));
                };
                if !state.sessions.contains_key(&target) {
                    return Outcome::fail(1, format!("can't find pane: {}\n", target));
                }
                self.type_text(state, &target, &text);
                Outcome::ok("")
            }
            "send-keys" => {
                if !state.sessions.contains_key(&target) {
                    return Outcome::fail(1, format!("can't find pane: {}\n", target));
                }
                for key in positional(rest, &["-t"]) {
                    self.send_key(state, &target, &key);
                }
                Outcome::ok("")
            }
            "capture-pane" => match state.sessions.get_mut(&target) {
                Some(pane) => {
                    pane.tick();
                    Outcome::ok(pane.render())
                }
                None => Outcome::fail(1, format!("can't find pane: {}\n", target)),
            },
            "clear-history" => match state.sessions.get_mut(&target) {
                Some(pane) => {
                    pane.lines.clear();
                    Outcome::ok("")
                }
                None => Outcome::fail(1, format!("can't find pane: {}\n", target)),
            },
            "set-environment" => {
                let Some(pane) = state.sessions.get_mut(&target) else {
                    return Outcome::fail(1, format!("can't find session: {}\n", target));
                };
                let values = positional(rest, &["-t"]);
                if rest.iter().any(|a| a == "-u") {
                    if let Some(key) = values.first() {
                        pane.env.remove(key);
                    }
                } else if let (Some(key), Some(value)) = (values.first(), values.get(1)) {
                    pane.env.insert(key.clone(), value.clone());
                }
                Outcome::ok("")
            }
            "show-environment" => {
                let Some(pane) = state.sessions.get(&target) else {
                    return Outcome::fail(1, format!("can't find session: {}\n", target));
                };
                let values = positional(rest, &["-t"]);
                let key = values.first().cloned().unwrap_or_default();
                match pane.env.get(&key) {
                    Some(value) => Outcome::ok(format!("{}={}\n", key, value)),
                    None => Outcome::fail(1, format!("unknown variable: {}\n", key)),
                }
            }
            "display-message" => {
                let Some(pane) = state.sessions.get_mut(&target) else {
                    return Outcome::fail(1, format!("can't find pane: {}\n", target));
                };
                pane.tick();
                let format = positional(rest, &["-t"]).first().cloned().unwrap_or_default();
                let value = match format.as_str() {
                    "#{pane_current_command}" => match pane.running.as_ref() {
                        Some(running) => running.program.clone(),
                        None => FAKE_SHELL.to_string(),
                    },
                    "#{pane_pid}" => pane.pane_pid.to_string(),
                    other => other.to_string(),
                };
                Outcome::ok(format!("{}\n", value))
            }
            other => Outcome::fail(1, format!("unknown command: {}\n", other)),
        }
    }

    fn send_key(&self, state: &mut FakeState, target: &str, key: &str) {
        let Some(pane) = state.sessions.get_mut(target) else {
            return;
        };
        match key {
            "Enter" => self.submit(state, target),
            "C-c" => pane.interrupt(),
            "C-l" => {
                if pane.running.is_none() {
                    pane.lines.clear();
                }
            }
            "Space" => pane.input.push(' '),
            "Tab" => pane.input.push('\t'),
            "BSpace" => {
                pane.input.pop();
            }
            k if is_key_name(k) => {}
            literal => pane.input.push_str(literal),
        }
    }

    fn type_text(&self, state: &mut FakeState, target: &str, text: &str) {
        let mut parts = text.split('\n').peekable();
        while let Some(part) = parts.next() {
            if let Some(pane) = state.sessions.get_mut(target) {
                pane.input.push_str(part);
            }
            if parts.peek().is_some() {
                self.submit(state, target);
            }
        }
    }

    fn submit(&self, state: &mut FakeState, target: &str) {
        let Some(pane) = state.sessions.get_mut(target) else {
            return;
        };
        let input = std::mem::take(&mut pane.input);

        if pane.running.is_some() {
            // A running program consumes the line
            pane.lines.push(input);
            return;
        }

        pane.lines.push(format!("{} {}", FAKE_PROMPT, input).trim_end().to_string());

        let (command, done_marker) = match parse_wrapper(&input) {
            Some((token, command)) => {
                pane.lines.push(format!("__TA_START_{}__", token));
                (command, Some(format!("__TA_DONE_{}__", token)))
            }
            None => (input.trim().to_string(), None),
        };

        *state.submissions.entry(command.clone()).or_insert(0) += 1;
        let behaviour = state
            .commands
            .get(&command)
            .cloned()
            .unwrap_or_else(|| default_behaviour(&command));

        let Some(pane) = state.sessions.get_mut(target) else {
            return;
        };
        if command == "clear" {
            pane.lines.clear();
        }
        let program = behaviour.program.clone().unwrap_or_else(|| {
            command
                .split_whitespace()
                .next()
                .unwrap_or(FAKE_SHELL)
                .to_string()
        });
        pane.running = Some(RunningCommand {
            remaining: behaviour.output.into_iter().collect(),
            ticks_left: behaviour.ticks,
            exit_code: behaviour.exit_code,
            done_marker,
            program,
        });
        if behaviour.ticks == 0 {
            pane.finish();
        }
    }
}

/// Tmux key names that do not type text
fn is_key_name(key: &str) -> bool {
    if KEY_NAMES.contains(&key) {
        return true;
    }
    if let Some(number) = key.strip_prefix('F') {
        return number.parse::<u8>().is_ok_and(|n| (1..=12).contains(&n));
    }
    ["C-", "M-"].iter().any(|prefix| key.starts_with(prefix)) && key.len() <= 5
}

/// Token and decoded command of a marker-wrapped script
fn parse_wrapper(input: &str) -> Option<(String, String)> {
    let after_start = input.split_once("'__TA_START_' '")?.1;
    let token = after_start.split_once("__'")?.0;
    let after_printf = after_start.split_once("eval \"$(printf '%s' '")?.1;
    let encoded = after_printf.split_once('\'')?.0;
    let bytes = general_purpose::STANDARD.decode(encoded).ok()?;
    Some((token.to_string(), String::from_utf8_lossy(&bytes).to_string()))
}

fn default_behaviour(command: &str) -> FakeCommand {
    let words: Vec<String> = tokenize(command)
        .into_iter()
        .filter_map(|token| match token {
            Token::Word(word) => Some(word),
            _ => None,
        })
        .collect();
    match words.first().map(String::as_str) {
        None | Some("set") | Some("clear") | Some("cd") | Some("export") | Some("true") => FakeCommand::new(Vec::<String>::new()),
        Some("echo") => FakeCommand::new([words[1..].join(" ")]),
        Some("false") => FakeCommand::new(Vec::<String>::new()).exit_code(1),
        Some("sleep") => {
            let seconds: u32 = words.get(1).and_then(|s| s.parse().ok()).unwrap_or(1);
            FakeCommand::new(Vec::<String>::new()).ticks(seconds.saturating_mul(10).max(1))
        }
        Some(other) => FakeCommand::new([format!("bash: {}: command not found", other)]).exit_code(127),
    }
}

impl Default for FakeSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn run(&self, command: &str, options: RunOptions) -> crate::Result<RunOutput> {
        let outcome = {
            let mut state = self.lock();
            state.run_log.push(command.to_string());
            if state.blank_runs > 0 {
                state.blank_runs -= 1;
                Outcome::ok("")
            } else {
                self.execute_line(&mut state, command, &options)
            }
        };

        if let Some(sink) = options.on_output.as_ref() {
            if !outcome.stdout.is_empty() {
                sink(&outcome.stdout);
            }
        }

        Ok(RunOutput {
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.code,
        })
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn opts() -> RunOptions {
        RunOptions::with_timeout(Duration::from_secs(1))
    }

    #[test]
    fn test_tokenize_quotes_and_operators() {
        let tokens = tokenize(r"printf '%s' 'it'\''s' | base64 -d && echo ok; x || y");
        assert_eq!(
            tokens,
            vec![
                Token::Word("printf".into()),
                Token::Word("%s".into()),
                Token::Word("it's".into()),
                Token::Pipe,
                Token::Word("base64".into()),
                Token::Word("-d".into()),
                Token::And,
                Token::Word("echo".into()),
                Token::Word("ok".into()),
                Token::Semi,
                Token::Word("x".into()),
                Token::Or,
                Token::Word("y".into()),
            ]
        );
    }

    #[test]
    fn test_parse_wrapper() {
        let sentinel = crate::framing::Sentinel::new();
        let script = sentinel.wrap("echo hi");
        let (token, command) = parse_wrapper(&script).unwrap();
        assert_eq!(token, sentinel.token());
        assert_eq!(command, "echo hi");
        assert_eq!(parse_wrapper("echo hi"), None);
    }

    #[test]
    fn test_key_names() {
        assert!(is_key_name("Enter"));
        assert!(is_key_name("C-c"));
        assert!(is_key_name("C-S-t"));
        assert!(is_key_name("F12"));
        assert!(!is_key_name("F13"));
        assert!(!is_key_name("set +H"));
    }

    #[tokio::test]
    async fn test_shell_pipeline_and_conditionals() {
        let sandbox = FakeSandbox::new();
        let encoded = general_purpose::STANDARD.encode("hello");
        let output = sandbox
            .run(&format!("printf '%s' '{}' | base64 -d", encoded), opts())
            .await
            .unwrap();
        assert_eq!(output.stdout, "hello");

        let output = sandbox.run("false && echo no || echo yes", opts()).await.unwrap();
        assert_eq!(output.stdout, "yes\n");
    }

    #[tokio::test]
    async fn test_pane_runs_scripted_command_over_ticks() {
        let sandbox = FakeSandbox::new().with_command("build", FakeCommand::new(["one", "two"]).ticks(3));
        sandbox.run("'tmux' 'new-session' '-d' '-s' 'a'", opts()).await.unwrap();
        sandbox.run("'tmux' 'send-keys' '-t' '=a:' 'build' 'Enter'", opts()).await.unwrap();

        let first = sandbox.run("'tmux' 'capture-pane' '-p' '-t' '=a:'", opts()).await.unwrap();
        assert_eq!(first.stdout, "user@sandbox:~$ build\none\n");

        sandbox.run("'tmux' 'capture-pane' '-p' '-t' '=a:'", opts()).await.unwrap();
        let done = sandbox.run("'tmux' 'capture-pane' '-p' '-t' '=a:'", opts()).await.unwrap();
        assert_eq!(done.stdout, "user@sandbox:~$ build\none\ntwo\nuser@sandbox:~$ \n");
        assert_eq!(sandbox.submissions("build"), 1);
    }

    #[tokio::test]
    async fn test_interrupt_stops_running_command() {
        let sandbox = FakeSandbox::new();
        sandbox.run("'tmux' 'new-session' '-d' '-s' 'a'", opts()).await.unwrap();
        sandbox.run("'tmux' 'send-keys' '-t' '=a:' 'sleep 100' 'Enter'", opts()).await.unwrap();

        let pid = sandbox.run("'tmux' 'display-message' '-p' '-t' '=a:' '#{pane_pid}'", opts()).await.unwrap();
        let pgrep = format!("pgrep -P {}", pid.stdout.trim());
        assert!(sandbox.run(&pgrep, opts()).await.unwrap().success());

        sandbox.run("'tmux' 'send-keys' '-t' '=a:' 'C-c'", opts()).await.unwrap();
        assert!(!sandbox.run(&pgrep, opts()).await.unwrap().success());
        assert!(sandbox.pane_text("a").unwrap().contains("^C"));
    }

    #[tokio::test]
    async fn test_missing_backend() {
        let sandbox = FakeSandbox::without_backend();
        let output = sandbox.run("'tmux' 'has-session' '-t' '=a'", opts()).await.unwrap();
        assert_eq!(output.exit_code, 127);
    }
}
