//! Keyboard controls, status-line rendering and enrollment prompts on a
//! crossterm terminal.

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use crossterm::terminal::{self, ClearType};
use crossterm::{cursor, queue};
use facegate_core::{
    Command, Controls, Display, EnrollmentPrompt, FrameSource, FrameView, GateState, Tone,
};
use image::GrayImage;
use std::io::{self, BufRead, Write};
use std::time::Duration;

const KEY_WAIT: Duration = Duration::from_millis(10);

/// Raw mode for the lifetime of the guard.
pub struct RawMode;

impl RawMode {
    pub fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        println!();
    }
}

/// Writes bare `\n` as `\r\n`, so log lines start at column 0 while raw
/// mode is on.
pub struct CrlfWriter<W> {
    inner: W,
    after_cr: bool,
}

impl<W: Write> CrlfWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            after_cr: false,
        }
    }
}

impl<W: Write> Write for CrlfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = Vec::with_capacity(buf.len() + 2);
        for &byte in buf {
            if byte == b'\n' && !self.after_cr {
                out.push(b'\r');
            }
            out.push(byte);
            self.after_cr = byte == b'\r';
        }
        self.inner.write_all(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Run `f` with line-buffered input, restoring raw mode afterwards.
fn cooked<T>(f: impl FnOnce() -> T) -> T {
    let raw = terminal::is_raw_mode_enabled().unwrap_or(false);
    if raw {
        let _ = terminal::disable_raw_mode();
    }
    let out = f();
    if raw {
        let _ = terminal::enable_raw_mode();
    }
    out
}

fn next_key(wait: Duration) -> Option<KeyEvent> {
    match event::poll(wait) {
        Ok(true) => match event::read() {
            Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => Some(key),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read terminal event");
                None
            }
        },
        Ok(false) => None,
        Err(e) => {
            tracing::warn!(error = %e, "failed to poll terminal");
            None
        }
    }
}

fn is_cancel(key: &KeyEvent) -> bool {
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

fn key_command(key: &KeyEvent) -> Option<Command> {
    if is_cancel(key) {
        return Some(Command::Quit);
    }
    match key.code {
        KeyCode::Char('a') => Some(Command::Register),
        _ => None,
    }
}

/// `a` registers a new user, `q` quits.
pub struct KeyboardControls;

impl Controls for KeyboardControls {
    fn poll(&mut self) -> Option<Command> {
        next_key(KEY_WAIT).as_ref().and_then(key_command)
    }
}

/// One status line, redrawn in place every frame.
pub struct StatusLine {
    out: io::Stdout,
}

impl StatusLine {
    pub fn new() -> Self {
        Self { out: io::stdout() }
    }

    fn draw(&mut self, text: &str, color: Option<Color>) -> io::Result<()> {
        queue!(
            self.out,
            cursor::MoveToColumn(0),
            terminal::Clear(ClearType::CurrentLine)
        )?;
        if let Some(color) = color {
            queue!(self.out, SetForegroundColor(color))?;
        }
        queue!(self.out, Print(text), ResetColor)?;
        self.out.flush()
    }
}

impl Default for StatusLine {
    fn default() -> Self {
        Self::new()
    }
}

fn tone_color(tone: Tone) -> Color {
    match tone {
        Tone::Granted => Color::Green,
        Tone::Denied => Color::Red,
        Tone::Notice => Color::Yellow,
    }
}

/// Status text for one rendered frame.
pub fn status_text(view: &FrameView<'_>) -> String {
    let state = match view.state {
        GateState::Idle => "idle",
        GateState::Scanning | GateState::Matching => "scanning",
        GateState::EnrollmentSuspended => "registering",
        GateState::Stopped => "stopped",
    };
    let faces = if view.faces.is_empty() {
        "no faces".to_string()
    } else {
        view.faces
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut text = format!("[{state}] {faces}");
    if let Some(feedback) = view.feedback {
        text.push_str(" | ");
        text.push_str(&feedback.message);
    }
    text.push_str("  (a: register, q: quit)");
    text
}

impl Display for StatusLine {
    fn show(&mut self, view: &FrameView<'_>) {
        let color = view.feedback.map(|f| tone_color(f.tone));
        if let Err(e) = self.draw(&status_text(view), color) {
            tracing::debug!(error = %e, "status line write failed");
        }
    }

    fn alert(&mut self, message: &str) {
        let _ = self.draw(message, Some(Color::Red));
        print!("\r\n");
        let _ = self.out.flush();
    }
}

/// Operator prompts on the controlling terminal.
///
/// A preset name or `assume_yes` answers the corresponding prompt without
/// asking, for the standalone `enroll` command.
#[derive(Default)]
pub struct TerminalPrompt {
    preset_name: Option<String>,
    assume_yes: bool,
}

impl TerminalPrompt {
    pub fn new(preset_name: Option<String>, assume_yes: bool) -> Self {
        Self {
            preset_name,
            assume_yes,
        }
    }
}

fn read_line(question: &str) -> Option<String> {
    cooked(|| {
        print!("\r\n{question}");
        io::stdout().flush().ok()?;
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read from stdin");
                None
            }
        }
    })
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

impl EnrollmentPrompt for TerminalPrompt {
    fn ask_name(&mut self) -> Option<String> {
        if let Some(name) = self.preset_name.take() {
            return Some(name);
        }
        read_line("Enter the name of the user: ")
    }

    fn confirm_overwrite(&mut self, name: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        read_line(&format!("User '{name}' already exists. Overwrite? [y/N] "))
            .is_some_and(|answer| is_yes(&answer))
    }

    fn capture(&mut self, camera: &mut dyn FrameSource) -> Option<GrayImage> {
        let _raw = if terminal::is_raw_mode_enabled().unwrap_or(false) {
            None
        } else {
            match RawMode::enable() {
                Ok(guard) => Some(guard),
                Err(e) => {
                    tracing::warn!(error = %e, "cannot enter raw mode");
                    return None;
                }
            }
        };

        let mut status = StatusLine::new();
        let _ = status.draw("\r\nPress SPACE to capture, q to cancel", None);
        let mut latest = None;
        loop {
            match camera.next_frame() {
                Ok(frame) => latest = Some(frame),
                Err(e) => tracing::warn!(error = %e, "failed to grab frame during registration"),
            }
            let Some(key) = next_key(KEY_WAIT) else { continue };
            if is_cancel(&key) {
                tracing::info!("capture cancelled");
                return None;
            }
            if key.code == KeyCode::Char(' ') {
                if let Some(frame) = latest.take() {
                    let _ = status.draw("Captured.", None);
                    print!("\r\n");
                    return Some(frame);
                }
            }
        }
    }
}
