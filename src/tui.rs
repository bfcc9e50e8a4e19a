use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::app::{Phase, ProgressEvent, ProgressSink, ProgressSinkKind};
use crate::error::AtbError;

const EVENTS_MAX: usize = 8;
const SPINNER: &[&str] = &["|", "/", "-", "\\"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum ArchiveState {
    Queued,
    Fetching,
    Retrying(u32),
    Ready(String),
    Failed,
    Extracting,
}

impl ArchiveState {
    fn label(&self) -> String {
        match self {
            ArchiveState::Queued => "queued".to_string(),
            ArchiveState::Fetching => "fetching".to_string(),
            ArchiveState::Retrying(attempt) => format!("retry #{attempt}"),
            ArchiveState::Ready(status) => status.clone(),
            ArchiveState::Failed => "failed".to_string(),
            ArchiveState::Extracting => "extracting".to_string(),
        }
    }

    fn color(&self) -> Color {
        match self {
            ArchiveState::Queued => Color::Gray,
            ArchiveState::Fetching | ArchiveState::Extracting => Color::Cyan,
            ArchiveState::Retrying(_) => Color::Yellow,
            ArchiveState::Ready(_) => Color::Green,
            ArchiveState::Failed => Color::Red,
        }
    }
}

#[derive(Debug)]
struct AppState {
    status: String,
    phase: Phase,
    latency_ms: Option<u128>,
    retries: u32,
    requests: u64,
    archives: BTreeMap<String, ArchiveState>,
    events: VecDeque<String>,
    started: Instant,
    active: bool,
}

pub struct Tui {
    kind: ProgressSinkKind,
    state: Arc<Mutex<AppState>>,
}

struct TuiProgress {
    state: Arc<Mutex<AppState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            apply_event(&mut state, event.message.trim());
        }
    }
}

impl Tui {
    pub fn new(kind: ProgressSinkKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(AppState {
                status: "ready".to_string(),
                phase: Phase::Planning,
                latency_ms: None,
                retries: 0,
                requests: 0,
                archives: BTreeMap::new(),
                events: VecDeque::new(),
                started: Instant::now(),
                active: false,
            })),
        }
    }

    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, AtbError> + Send + 'static,
        R: Send + 'static,
    {
        self.set_active(true);

        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        loop {
            if let Ok(state) = self.state.lock() {
                terminal
                    .draw(|frame| draw_ui(frame, self.kind, &state, tick))
                    .into_diagnostic()?;
            }

            if let Ok(result) = rx.try_recv() {
                self.set_active(false);
                restore_terminal()?;
                handle.join().ok();
                return result.map_err(miette::Report::new);
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if self.handle_key(key) {
                        break;
                    }
                }
            }

            tick = tick.wrapping_add(1);
        }

        self.set_active(false);
        restore_terminal()?;
        Err(miette::Report::msg("aborted"))
    }

    fn handle_key(&self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        match key.code {
            KeyCode::Esc => true,
            KeyCode::Char('q') => !self.is_active(),
            _ => false,
        }
    }

    fn is_active(&self) -> bool {
        self.state.lock().map(|state| state.active).unwrap_or(false)
    }

    fn set_active(&self, active: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.active = active;
            if active {
                state.started = Instant::now();
            }
        }
    }
}

fn restore_terminal() -> miette::Result<()> {
    disable_raw_mode().into_diagnostic()?;
    let mut stdout = io::stdout();
    stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
    Ok(())
}

fn apply_event(state: &mut AppState, message: &str) {
    if let Some((phase, payload)) = parse_phase(message) {
        state.phase = phase;
        state.status = payload.to_string();
        if phase == Phase::Extracting {
            if let Some(archive) = state.archives.get_mut(payload) {
                *archive = ArchiveState::Extracting;
            }
        }
    } else if let Some(archive) = field(message, "archive") {
        let archive = archive.to_string();
        if message.starts_with("fetch.request") {
            state.requests = state.requests.saturating_add(1);
            state.archives.insert(archive, ArchiveState::Fetching);
        } else if message.starts_with("fetch.retry") {
            state.retries = state.retries.saturating_add(1);
            state.requests = state.requests.saturating_add(1);
            let attempt = field(message, "attempt")
                .and_then(|value| value.parse().ok())
                .unwrap_or(0);
            state.archives.insert(archive, ArchiveState::Retrying(attempt));
        } else if message.starts_with("fetch.done") {
            let status = field(message, "status").unwrap_or("done");
            let next = if status == "failed" {
                ArchiveState::Failed
            } else {
                ArchiveState::Ready(status.to_string())
            };
            state.archives.insert(archive, next);
        } else if message.starts_with("extract.done") {
            let next = match field(message, "status") {
                Some("failed") => ArchiveState::Failed,
                Some(status) => ArchiveState::Ready(status.to_string()),
                None => ArchiveState::Ready("extracted".to_string()),
            };
            state.archives.insert(archive, next);
        } else if message.starts_with("fetch.response") {
            state.latency_ms = field(message, "latency_ms").and_then(|value| value.parse().ok());
        } else {
            state.archives.entry(archive).or_insert(ArchiveState::Queued);
        }
    } else {
        state.status = message.to_string();
    }

    push_event(&mut state.events, format!("[{}] {message}", timestamp()));
}

fn draw_ui(frame: &mut ratatui::Frame, kind: ProgressSinkKind, state: &AppState, tick: usize) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(EVENTS_MAX as u16 + 2),
        ])
        .split(frame.area());
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(rows[1]);

    frame.render_widget(draw_header(kind, state, tick), rows[0]);
    frame.render_widget(draw_status_panel(state), columns[0]);
    frame.render_widget(draw_archives_panel(state), columns[1]);
    frame.render_widget(draw_events(state), rows[2]);
}

fn draw_header(kind: ProgressSinkKind, state: &AppState, tick: usize) -> Paragraph<'static> {
    let spinner = if state.active {
        SPINNER[tick % SPINNER.len()]
    } else {
        " "
    };
    let title = match kind {
        ProgressSinkKind::Fetch => "fetch",
        ProgressSinkKind::Plan => "plan",
    };
    Paragraph::new(Line::from(vec![
        Span::styled(
            "KIRA-ATB ",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("{title} {spinner} ")),
        Span::styled(
            format!("[{}] ", state.phase.label()),
            Style::default().fg(Color::Yellow),
        ),
        Span::raw(state.status.clone()),
    ]))
    .block(Block::default().borders(Borders::ALL))
}

fn draw_status_panel(state: &AppState) -> Paragraph<'static> {
    let total = state.archives.len();
    let settled = state
        .archives
        .values()
        .filter(|archive| matches!(archive, ArchiveState::Ready(_) | ArchiveState::Failed))
        .count();
    let failed = state
        .archives
        .values()
        .filter(|archive| matches!(archive, ArchiveState::Failed))
        .count();
    let latency = state
        .latency_ms
        .map(|value| format!("{value} ms"))
        .unwrap_or_else(|| "--".to_string());
    let elapsed = state.started.elapsed().as_secs();

    let gray = Style::default().fg(Color::Gray);
    let lines = vec![
        Line::from(vec![
            Span::styled("Archives: ", gray),
            Span::raw(format!("{settled}/{total} settled")),
        ]),
        Line::from(vec![
            Span::styled("Failed: ", gray),
            Span::styled(
                failed.to_string(),
                Style::default().fg(if failed > 0 { Color::Red } else { Color::Green }),
            ),
        ]),
        Line::from(vec![
            Span::styled("Requests: ", gray),
            Span::raw(state.requests.to_string()),
            Span::styled("   Retries: ", gray),
            Span::raw(state.retries.to_string()),
        ]),
        Line::from(vec![Span::styled("Last latency: ", gray), Span::raw(latency)]),
        Line::from(vec![
            Span::styled("Elapsed: ", gray),
            Span::raw(format!("{elapsed}s")),
        ]),
        Line::from(Span::styled("Esc aborts", gray)),
    ];

    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("STATUS"))
        .wrap(Wrap { trim: true })
}

fn draw_archives_panel(state: &AppState) -> Paragraph<'static> {
    let lines: Vec<Line> = state
        .archives
        .iter()
        .map(|(name, archive)| {
            Line::from(vec![
                Span::styled(
                    format!("{:<12} ", archive.label()),
                    Style::default().fg(archive.color()),
                ),
                Span::raw(name.clone()),
            ])
        })
        .collect();
    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("ARCHIVES"))
}

fn draw_events(state: &AppState) -> Paragraph<'static> {
    let lines: Vec<Line> = state
        .events
        .iter()
        .map(|event| Line::from(event.clone()))
        .collect();
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("EVENTS"))
        .wrap(Wrap { trim: true })
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (label, payload) = rest.split_once(';')?;
    let phase = match label {
        "Plan" => Phase::Planning,
        "Fetch" => Phase::Fetching,
        "Extract" => Phase::Extracting,
        "Done" => Phase::Done,
        _ => return None,
    };
    Some((phase, payload.trim()))
}

fn field<'a>(message: &'a str, key: &str) -> Option<&'a str> {
    message.split_whitespace().find_map(|token| {
        token
            .split_once('=')
            .filter(|(name, _)| *name == key)
            .map(|(_, value)| value)
    })
}

fn push_event(buffer: &mut VecDeque<String>, item: String) {
    buffer.push_back(item);
    while buffer.len() > EVENTS_MAX {
        buffer.pop_front();
    }
}

fn timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs();
    let hours = (secs / 3600) % 24;
    let mins = (secs / 60) % 60;
    let seconds = secs % 60;
    format!("{hours:02}:{mins:02}:{seconds:02}")
}
