//! Echo & Prompt Filter
//!
//! Transforms the raw PTY byte stream into the normalized stream every
//! consumer sees. The contract: each submitted command appears exactly once,
//! on the line of the canonical prompt that preceded it; its output follows;
//! the next canonical prompt marks completion. Initialization noise is
//! discarded, exit-code marker lines are elided, CR-LF is never collapsed.
//!
//! The filter is a single-threaded state machine. It is driven only from
//! the session reader task, which feeds it raw bytes, command registrations
//! and injected text through one FIFO, so no locking is needed here.

use log::{debug, warn};
use regex::Regex;

/// Canonical prompt at the start of a line, `[user@host cwd]$ `.
const PROMPT_AT_LINE_START: &str = r"(?m)^\[[^@\r\n]+@[^ \r\n]+ [^\]\r\n]+\]\$ ";
/// An unterminated tail that is exactly a canonical prompt.
const PROMPT_FULL: &str = r"^\[[^@\r\n]+@[^ \r\n]+ [^\]\r\n]+\]\$ $";
/// Exit-code marker line appended to every submitted command.
const RC_MARKER: &str = r"^__rc:(\d+)$";
/// Marker glued to the last output line when the command's output had no
/// trailing newline (`printf abc`). Found at completion time.
const RC_MARKER_TRAILING: &str = r"__rc:(\d+)(\r?\n)?$";

/// Longest unterminated line tail the filter will hold back while it could
/// still turn into a prompt or marker. Beyond this the tail is flushed.
const HOLDBACK_MAX: usize = 256;

/// Upper bound on buffered initialization noise before the first prompt.
const INIT_BUF_MAX: usize = 16 * 1024;

/// One chunk of the normalized stream, with its session-monotonic sequence
/// number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedChunk {
    pub seq: u64,
    pub data: String,
}

/// Events produced while consuming the raw stream.
#[derive(Debug)]
pub enum FilterEvent {
    /// A normalized chunk for history and fan-out.
    Chunk(NormalizedChunk),
    /// The first canonical prompt was observed; the shell is ready.
    Ready,
    /// The in-flight command completed: a fresh prompt was observed.
    /// `stdout` is the captured output with line endings normalized to LF;
    /// `exit_code` is -1 when no marker line was seen.
    CommandComplete { exit_code: i32, stdout: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    /// Discarding everything until the first canonical prompt.
    Init,
    /// Normal filtering.
    Live,
}

/// The command currently registered with the filter.
struct PendingCommand {
    /// Original command text (no marker suffix).
    text: String,
    /// Exact bytes written to the shell, minus the trailing newline.
    wire: String,
    /// True until the first output line; a raw echo of the command inside
    /// this window is dropped (shells that re-enable echo).
    echo_open: bool,
    /// Output captured between the echo line and the completion prompt.
    captured: String,
    /// Exit code parsed from the `__rc:` marker line.
    exit_code: Option<i32>,
}

/// See module docs. Construct one per session.
pub struct EchoPromptFilter {
    phase: Phase,
    next_seq: u64,
    /// Unemitted raw text. Complete lines are drained eagerly; an
    /// unterminated tail is held only while it could still become a prompt,
    /// a marker, or the registered command's echo.
    buf: String,
    /// True when the current (unterminated) line already had bytes emitted,
    /// so its remainder can no longer match a line-start pattern.
    line_partially_emitted: bool,
    pending: Option<PendingCommand>,
    prompt_at_line_start: Regex,
    prompt_full: Regex,
    rc_marker: Regex,
    rc_marker_trailing: Regex,
}

impl Default for EchoPromptFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoPromptFilter {
    pub fn new() -> Self {
        Self {
            phase: Phase::Init,
            next_seq: 0,
            buf: String::new(),
            line_partially_emitted: false,
            pending: None,
            prompt_at_line_start: Regex::new(PROMPT_AT_LINE_START).expect("prompt regex"),
            prompt_full: Regex::new(PROMPT_FULL).expect("prompt regex"),
            rc_marker: Regex::new(RC_MARKER).expect("marker regex"),
            rc_marker_trailing: Regex::new(RC_MARKER_TRAILING).expect("marker regex"),
        }
    }

    /// Register a command about to be written to the shell. Must be called
    /// before the command bytes are written. Emits the synthetic echo line
    /// (command text, CR-LF) continuing the already-emitted prompt line, so
    /// the stream reads `prompt command / output / prompt`.
    pub fn register_command(
        &mut self,
        text: &str,
        wire: &str,
        wants_echo: bool,
    ) -> Vec<FilterEvent> {
        let mut events = Vec::new();
        if self.pending.is_some() {
            // The executor serializes submissions; getting here means a
            // completion was lost. Resolve the old command so its sink is
            // not leaked.
            warn!("command registered while another is pending, force-completing previous");
            self.finish_pending(&mut events);
        }
        // Anything still held back belongs to the pre-command stream.
        self.flush_tail(&mut events);
        self.pending = Some(PendingCommand {
            text: text.to_string(),
            wire: wire.to_string(),
            echo_open: true,
            captured: String::new(),
            exit_code: None,
        });
        if wants_echo && self.phase == Phase::Live {
            self.emit_raw(format!("{}\r\n", text), &mut events);
            self.line_partially_emitted = false;
        }
        events
    }

    /// Emit synthetic text into the normalized stream (e.g. `^C` feedback
    /// on cancellation). The text is not captured as command output.
    pub fn inject_text(&mut self, text: &str) -> Vec<FilterEvent> {
        let mut events = Vec::new();
        if self.phase == Phase::Live {
            self.flush_tail(&mut events);
            self.emit_raw(text.to_string(), &mut events);
            self.line_partially_emitted = !text.ends_with('\n');
        }
        events
    }

    /// Consume raw bytes from the shell and produce normalized events.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<FilterEvent> {
        let mut events = Vec::new();
        self.buf.push_str(&String::from_utf8_lossy(bytes));

        if self.phase == Phase::Init {
            match self.prompt_at_line_start.find(&self.buf) {
                Some(m) => {
                    let start = m.start();
                    self.buf.drain(..start);
                    self.phase = Phase::Live;
                    debug!("first canonical prompt observed, filtering is live");
                    events.push(FilterEvent::Ready);
                }
                None => {
                    // Bound the init noise; keep a window large enough to
                    // still catch a prompt split across chunks.
                    if self.buf.len() > INIT_BUF_MAX {
                        let cut = self.buf.len() - 2048;
                        self.buf.drain(..cut);
                    }
                    return events;
                }
            }
        }

        self.drain_live(&mut events);
        events
    }

    /// Fail the stream: resolve any pending command without a prompt.
    /// Used when the transport is lost mid-command.
    pub fn abort_pending(&mut self) -> Option<(i32, String)> {
        self.pending.take().map(|p| {
            (
                p.exit_code.unwrap_or(-1),
                p.captured.replace("\r\n", "\n"),
            )
        })
    }

    fn drain_live(&mut self, events: &mut Vec<FilterEvent>) {
        loop {
            match self.buf.find('\n') {
                Some(nl) => {
                    let line: String = self.buf.drain(..=nl).collect();
                    if self.line_partially_emitted {
                        self.line_partially_emitted = false;
                        // The remainder of a line whose head is already out.
                        // It can still be the raw echo continuing a prompt
                        // line we emitted (shell with echo re-enabled).
                        if self.suppress_echo_line(&line) {
                            continue;
                        }
                        self.emit_output(line, events);
                        continue;
                    }
                    self.handle_line(line, events);
                }
                None => {
                    self.handle_tail(events);
                    break;
                }
            }
        }
    }

    /// A complete line whose start was not yet emitted.
    fn handle_line(&mut self, line: String, events: &mut Vec<FilterEvent>) {
        let content = line_content(&line);

        if self.suppress_echo_line(&line) {
            return;
        }

        if let Some(m) = self.prompt_at_line_start.find(content) {
            if m.start() == 0 {
                let rest = &content[m.end()..];
                if rest.is_empty() {
                    // A bare prompt terminated by a newline: completion.
                    self.finish_pending(events);
                    self.emit_raw(line, events);
                    return;
                }
                // Prompt followed by the registered command on one line is
                // the raw echo (prompt printed, then typed bytes echoed).
                if let Some(p) = &mut self.pending {
                    if p.echo_open && (rest == p.text || rest == p.wire) {
                        p.echo_open = false;
                        return;
                    }
                }
                // Otherwise prompt-shaped output; fall through.
            }
        }

        if let Some(p) = &mut self.pending {
            if let Some(caps) = self.rc_marker.captures(content) {
                let code = caps
                    .get(1)
                    .and_then(|m| m.as_str().parse::<i32>().ok())
                    .unwrap_or(-1);
                p.exit_code = Some(code);
                p.echo_open = false;
                return;
            }
        }

        self.emit_output(line, events);
    }

    /// An unterminated tail. Emit it, hold it, or recognize a prompt.
    fn handle_tail(&mut self, events: &mut Vec<FilterEvent>) {
        if self.buf.is_empty() {
            return;
        }
        if self.line_partially_emitted {
            let tail = std::mem::take(&mut self.buf);
            self.emit_output(tail, events);
            return;
        }
        if self.prompt_full.is_match(&self.buf) {
            let prompt = std::mem::take(&mut self.buf);
            self.finish_pending(events);
            self.emit_raw(prompt, events);
            self.line_partially_emitted = true;
            return;
        }
        if self.should_hold_tail() {
            return;
        }
        let tail = std::mem::take(&mut self.buf);
        self.emit_output(tail, events);
        self.line_partially_emitted = true;
    }

    /// Whether the current tail could still become something we must not
    /// stream through: a prompt, a marker line, or the command's raw echo.
    fn should_hold_tail(&self) -> bool {
        if self.buf.len() > HOLDBACK_MAX {
            return false;
        }
        if could_be_prompt_prefix(&self.buf) {
            return true;
        }
        if let Some(p) = &self.pending {
            if could_be_marker_prefix(&self.buf) {
                return true;
            }
            if p.echo_open && (p.wire.starts_with(&self.buf) || p.text.starts_with(&self.buf)) {
                return true;
            }
        }
        false
    }

    /// Drop the line if it is the raw echo of the registered command.
    fn suppress_echo_line(&mut self, line: &str) -> bool {
        let content = line_content(line);
        if let Some(p) = &mut self.pending {
            if p.echo_open && (content == p.wire || content == p.text) {
                debug!("suppressed raw command echo");
                p.echo_open = false;
                return true;
            }
        }
        false
    }

    fn finish_pending(&mut self, events: &mut Vec<FilterEvent>) {
        if let Some(p) = self.pending.take() {
            let mut stdout = p.captured.replace("\r\n", "\n");
            let mut exit_code = p.exit_code;
            if exit_code.is_none() {
                // Output without a trailing newline glues the marker to the
                // last line; recover the code and strip the marker.
                if let Some(caps) = self.rc_marker_trailing.captures(&stdout) {
                    exit_code = caps.get(1).and_then(|m| m.as_str().parse::<i32>().ok());
                    let start = caps.get(0).map(|m| m.start()).unwrap_or(stdout.len());
                    stdout.truncate(start);
                }
            }
            events.push(FilterEvent::CommandComplete {
                exit_code: exit_code.unwrap_or(-1),
                stdout,
            });
        }
    }

    fn flush_tail(&mut self, events: &mut Vec<FilterEvent>) {
        if !self.buf.is_empty() {
            let tail = std::mem::take(&mut self.buf);
            self.emit_output(tail, events);
            self.line_partially_emitted = true;
        }
    }

    /// Emit command output: streamed and captured.
    fn emit_output(&mut self, data: String, events: &mut Vec<FilterEvent>) {
        if let Some(p) = &mut self.pending {
            p.captured.push_str(&data);
            p.echo_open = false;
        }
        self.emit_raw(data, events);
    }

    /// Emit stream text that is not command output (prompts, echo lines,
    /// injected feedback).
    fn emit_raw(&mut self, data: String, events: &mut Vec<FilterEvent>) {
        if data.is_empty() {
            return;
        }
        let chunk = NormalizedChunk {
            seq: self.next_seq,
            data,
        };
        self.next_seq += 1;
        events.push(FilterEvent::Chunk(chunk));
    }
}

/// Line text without its terminator (`\r\n` or `\n`).
fn line_content(line: &str) -> &str {
    line.strip_suffix("\r\n")
        .or_else(|| line.strip_suffix('\n'))
        .unwrap_or(line)
}

/// Could `s` still grow into a canonical prompt? Walks the prompt shape
/// `[user@host cwd]$ ` stage by stage and accepts when input runs out
/// while still consistent.
fn could_be_prompt_prefix(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        None => return true,
        Some('[') => {}
        Some(_) => return false,
    }
    // 1 = user, 2 = host, 3 = cwd, 4 = saw ']', 5 = saw '$'
    let mut stage = 1u8;
    let mut seen = 0usize;
    for c in chars {
        if c == '\r' || c == '\n' {
            return false;
        }
        match stage {
            1 => {
                if c == '@' {
                    if seen == 0 {
                        return false;
                    }
                    stage = 2;
                    seen = 0;
                } else {
                    seen += 1;
                }
            }
            2 => {
                if c == ' ' {
                    if seen == 0 {
                        return false;
                    }
                    stage = 3;
                    seen = 0;
                } else {
                    seen += 1;
                }
            }
            3 => {
                if c == ']' {
                    if seen == 0 {
                        return false;
                    }
                    stage = 4;
                } else {
                    seen += 1;
                }
            }
            4 => {
                if c != '$' {
                    return false;
                }
                stage = 5;
            }
            _ => {
                // Already a full prompt plus trailing space; anything more
                // is ordinary text, handled elsewhere.
                return false;
            }
        }
    }
    true
}

/// Could `s` still grow into an `__rc:<digits>` marker line? A trailing
/// `\r` is part of the line terminator still awaiting its `\n`.
fn could_be_marker_prefix(s: &str) -> bool {
    const MARKER: &str = "__rc:";
    if s.len() < MARKER.len() {
        return MARKER.as_bytes().starts_with(s.as_bytes());
    }
    let rest = match s.strip_prefix(MARKER) {
        Some(rest) => rest,
        None => return false,
    };
    let rest = rest.strip_suffix('\r').unwrap_or(rest);
    rest.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPT: &str = "[alice@web01 ~]$ ";

    fn chunks(events: &[FilterEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                FilterEvent::Chunk(c) => Some(c.data.as_str()),
                _ => None,
            })
            .collect()
    }

    fn completion(events: &[FilterEvent]) -> Option<(i32, String)> {
        events.iter().find_map(|e| match e {
            FilterEvent::CommandComplete { exit_code, stdout } => {
                Some((*exit_code, stdout.clone()))
            }
            _ => None,
        })
    }

    fn live_filter() -> EchoPromptFilter {
        let mut f = EchoPromptFilter::new();
        let events = f.feed(PROMPT.as_bytes());
        assert!(matches!(events[0], FilterEvent::Ready));
        f
    }

    #[test]
    fn test_init_noise_is_discarded() {
        let mut f = EchoPromptFilter::new();
        let noise = b"stty -echo > /dev/null 2>&1\r\nexport PS1='[\\u@\\h \\W]$ ' > /dev/null 2>&1\r\n";
        assert!(f.feed(noise).is_empty());
        let events = f.feed(PROMPT.as_bytes());
        assert!(matches!(events[0], FilterEvent::Ready));
        assert_eq!(chunks(&events), PROMPT);
    }

    #[test]
    fn test_single_command_round_trip() {
        let mut f = live_filter();
        let reg = f.register_command("whoami", "whoami; echo \"__rc:$?\"", true);
        assert_eq!(chunks(&reg), "whoami\r\n");

        let out = f.feed(b"alice\r\n__rc:0\r\n");
        assert_eq!(chunks(&out), "alice\r\n");
        assert!(completion(&out).is_none());

        let done = f.feed(PROMPT.as_bytes());
        let (code, stdout) = completion(&done).expect("completion");
        assert_eq!(code, 0);
        assert_eq!(stdout, "alice\n");
        assert_eq!(chunks(&done), PROMPT);
    }

    #[test]
    fn test_command_appears_exactly_once() {
        let mut f = live_filter();
        let mut text = String::new();
        text.push_str(&chunks(&f.register_command(
            "echo hello",
            "echo hello; echo \"__rc:$?\"",
            true,
        )));
        text.push_str(&chunks(&f.feed(b"hello\r\n__rc:0\r\n")));
        text.push_str(&chunks(&f.feed(PROMPT.as_bytes())));
        assert_eq!(text.matches("echo hello").count(), 1);
        assert_eq!(text.matches("hello\r\n").count(), 2); // echo line + output
    }

    #[test]
    fn test_raw_echo_is_suppressed() {
        // A shell that ignored `stty -echo` echoes the wire text back.
        let mut f = live_filter();
        f.register_command("pwd", "pwd; echo \"__rc:$?\"", true);
        let out = f.feed(b"pwd; echo \"__rc:$?\"\r\n/home/alice\r\n__rc:0\r\n");
        assert_eq!(chunks(&out), "/home/alice\r\n");
    }

    #[test]
    fn test_prompt_prefixed_echo_is_suppressed() {
        let mut f = live_filter();
        f.register_command("pwd", "pwd; echo \"__rc:$?\"", true);
        let out = f.feed(b"[alice@web01 ~]$ pwd; echo \"__rc:$?\"\r\n/home/alice\r\n");
        assert_eq!(chunks(&out), "/home/alice\r\n");
    }

    #[test]
    fn test_prompt_split_across_chunks() {
        let mut f = live_filter();
        f.register_command("true", "true; echo \"__rc:$?\"", true);
        f.feed(b"__rc:0\r\n");
        // Trailing prompt arrives byte by byte.
        let mut done = Vec::new();
        for b in PROMPT.as_bytes() {
            done.extend(f.feed(&[*b]));
        }
        let (code, stdout) = completion(&done).expect("completion");
        assert_eq!(code, 0);
        assert_eq!(stdout, "");
        assert_eq!(chunks(&done), PROMPT);
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let mut f = live_filter();
        f.register_command("false", "false; echo \"__rc:$?\"", true);
        f.feed(b"__rc");
        f.feed(b":1\r");
        let tail = f.feed(b"\n");
        assert_eq!(chunks(&tail), "");
        let done = f.feed(PROMPT.as_bytes());
        assert_eq!(completion(&done).expect("completion").0, 1);
    }

    #[test]
    fn test_crlf_preserved_in_stream() {
        let mut f = live_filter();
        f.register_command("ls", "ls; echo \"__rc:$?\"", true);
        let out = f.feed(b"a\r\nb\r\n");
        assert!(chunks(&out).contains("a\r\nb\r\n"));
        let done = f.feed(b"__rc:0\r\n");
        assert_eq!(chunks(&done), "");
        let (_, stdout) = completion(&f.feed(PROMPT.as_bytes())).expect("completion");
        // Captured stdout is LF-normalized for the result payload.
        assert_eq!(stdout, "a\nb\n");
    }

    #[test]
    fn test_partial_line_streams_without_newline() {
        let mut f = live_filter();
        f.register_command("progress", "progress; echo \"__rc:$?\"", true);
        // Not a prompt or marker prefix: must stream immediately.
        let out = f.feed(b"50% done...");
        assert_eq!(chunks(&out), "50% done...");
    }

    #[test]
    fn test_prompt_like_holdback_flushes_at_cap() {
        let mut f = live_filter();
        let long = format!("[{}", "x".repeat(HOLDBACK_MAX + 16));
        let out = f.feed(long.as_bytes());
        assert_eq!(chunks(&out), long);
    }

    #[test]
    fn test_idle_prompt_emits_no_completion() {
        let mut f = live_filter();
        let events = f.feed(format!("\r\n{}", PROMPT).as_bytes());
        assert!(completion(&events).is_none());
        assert!(chunks(&events).ends_with(PROMPT));
    }

    #[test]
    fn test_injected_text_passes_through() {
        let mut f = live_filter();
        f.register_command("sleep 30", "sleep 30; echo \"__rc:$?\"", true);
        let events = f.inject_text("^C\r\n");
        assert_eq!(chunks(&events), "^C\r\n");
        // ^C feedback is not captured as command output.
        let done = f.feed(format!("__rc:130\r\n{}", PROMPT).as_bytes());
        let (code, stdout) = completion(&done).expect("completion");
        assert_eq!(code, 130);
        assert_eq!(stdout, "");
    }

    #[test]
    fn test_marker_glued_to_unterminated_output() {
        // `printf abc` emits no trailing newline, so the marker lands on
        // the same line as the output.
        let mut f = live_filter();
        f.register_command("printf abc", "printf abc; echo \"__rc:$?\"", true);
        let done = f.feed(format!("abc__rc:0\r\n{}", PROMPT).as_bytes());
        let (code, stdout) = completion(&done).expect("completion");
        assert_eq!(code, 0);
        assert_eq!(stdout, "abc");
    }

    #[test]
    fn test_missing_marker_reports_unknown_exit() {
        let mut f = live_filter();
        f.register_command("kill -9 $$", "kill -9 $$; echo \"__rc:$?\"", true);
        let done = f.feed(format!("out\r\n{}", PROMPT).as_bytes());
        let (code, stdout) = completion(&done).expect("completion");
        assert_eq!(code, -1);
        assert_eq!(stdout, "out\n");
    }

    #[test]
    fn test_sequence_numbers_strictly_increase() {
        let mut f = live_filter();
        f.register_command("ls", "ls; echo \"__rc:$?\"", true);
        let mut all = Vec::new();
        all.extend(f.feed(b"one\r\n"));
        all.extend(f.feed(b"two\r\n"));
        let seqs: Vec<u64> = all
            .iter()
            .filter_map(|e| match e {
                FilterEvent::Chunk(c) => Some(c.seq),
                _ => None,
            })
            .collect();
        for w in seqs.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn test_prompt_prefix_walker() {
        assert!(could_be_prompt_prefix(""));
        assert!(could_be_prompt_prefix("["));
        assert!(could_be_prompt_prefix("[ali"));
        assert!(could_be_prompt_prefix("[alice@web"));
        assert!(could_be_prompt_prefix("[alice@web01 ~"));
        assert!(could_be_prompt_prefix("[alice@web01 ~]"));
        assert!(could_be_prompt_prefix("[alice@web01 ~]$"));
        assert!(!could_be_prompt_prefix("x["));
        assert!(!could_be_prompt_prefix("[@"));
        assert!(!could_be_prompt_prefix("[alice@web01 ~]x"));
        assert!(!could_be_prompt_prefix("[a\nb"));
    }

    #[test]
    fn test_marker_prefix_walker() {
        assert!(could_be_marker_prefix("_"));
        assert!(could_be_marker_prefix("__rc"));
        assert!(could_be_marker_prefix("__rc:"));
        assert!(could_be_marker_prefix("__rc:13"));
        assert!(could_be_marker_prefix("__rc:13\r"));
        assert!(!could_be_marker_prefix("__rc:13x"));
        assert!(!could_be_marker_prefix("rc:"));
    }
}
