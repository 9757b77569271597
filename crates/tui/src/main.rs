//! etop: encode pipeline dashboard
//!
//! Terminal view of the daemon's media list, pipeline counters and system
//! load. Polls `/metrics` and `/api/media` on the daemon (default
//! http://127.0.0.1:7878, override with `ETOP_URL`).

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Cell, Chart, Dataset, Gauge, Paragraph, Row, Table, Wrap},
    Frame, Terminal,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    io::{self, Stdout},
    time::{Duration, Instant},
};

const DEFAULT_URL: &str = "http://127.0.0.1:7878";
const POLL_INTERVAL_MS: u64 = 500;
const MAX_THROUGHPUT_POINTS: usize = 60;
const MAX_EVENT_LOG_ENTRIES: usize = 100;

// ============================================================================
// Data Models (mirroring the daemon's JSON)
// ============================================================================

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Pipeline counters and system stats from `/metrics`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub system: SystemMetrics,
    pub queue_len: usize,
    pub running_jobs: usize,
    pub dispatched_jobs: u64,
    pub succeeded_jobs: u64,
    pub failed_jobs: u64,
    pub chunk_sets_concatenated: u64,
    pub races_discarded: u64,
    pub hook_failures: u64,
    pub total_bytes_encoded: u64,
}

/// One row of `/api/media`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaSummary {
    pub id: String,
    pub title: String,
    pub media_type: Option<String>,
    pub encoding_status: String,
    pub duration: u64,
}

/// Log lines for counters that moved between two snapshots.
pub fn counter_events(prev: &MetricsSnapshot, next: &MetricsSnapshot) -> Vec<String> {
    let counters = [
        ("dispatched", prev.dispatched_jobs, next.dispatched_jobs),
        ("succeeded", prev.succeeded_jobs, next.succeeded_jobs),
        ("failed", prev.failed_jobs, next.failed_jobs),
        ("chunk sets joined", prev.chunk_sets_concatenated, next.chunk_sets_concatenated),
        ("duplicates discarded", prev.races_discarded, next.races_discarded),
        ("hook failures", prev.hook_failures, next.hook_failures),
    ];
    counters
        .iter()
        .filter(|(_, before, after)| after > before)
        .map(|(name, before, after)| format!("+{} {}", after - before, name))
        .collect()
}

// ============================================================================
// App State
// ============================================================================

/// Main application state for the dashboard
pub struct App {
    /// Latest metrics snapshot from the daemon
    pub metrics: Option<MetricsSnapshot>,
    /// Media list as of the last refresh
    pub media: Vec<MediaSummary>,
    /// Recent connection and counter events
    pub event_log: VecDeque<String>,
    /// Throughput history for chart (elapsed secs, MB encoded)
    pub throughput_history: VecDeque<(f64, f64)>,
    /// Connection status
    pub connected: bool,
    /// Daemon address without trailing slash
    base_url: String,
    /// HTTP client for polling
    client: reqwest::Client,
    /// Start time for throughput chart x-axis
    start_time: Instant,
}

impl App {
    /// Create a new App polling `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            metrics: None,
            media: Vec::new(),
            event_log: VecDeque::with_capacity(MAX_EVENT_LOG_ENTRIES),
            throughput_history: VecDeque::with_capacity(MAX_THROUGHPUT_POINTS),
            connected: false,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            start_time: Instant::now(),
        }
    }

    /// Add an event to the log, dropping the oldest when full
    pub fn log_event(&mut self, event: String) {
        if self.event_log.len() >= MAX_EVENT_LOG_ENTRIES {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event);
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, String> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP error: {}", response.status()));
        }
        response.json::<T>().await.map_err(|e| format!("JSON parse error: {}", e))
    }

    /// Fetch metrics, then the media list, from the daemon
    pub async fn refresh(&mut self) {
        match self.get_json::<MetricsSnapshot>("/metrics").await {
            Ok(snapshot) => self.apply_snapshot(snapshot),
            Err(e) => {
                if self.connected {
                    self.log_event(format!("Connection lost: {}", e));
                }
                self.connected = false;
                return;
            }
        }
        match self.get_json::<Vec<MediaSummary>>("/api/media").await {
            Ok(media) => self.media = media,
            Err(e) => self.log_event(e),
        }
    }

    /// Log counter changes and extend the throughput history
    pub fn apply_snapshot(&mut self, snapshot: MetricsSnapshot) {
        if !self.connected {
            self.log_event(format!("Connected to {}", self.base_url));
        }
        if let Some(prev) = &self.metrics {
            for event in counter_events(prev, &snapshot) {
                self.log_event(event);
            }
        }

        let elapsed_secs = self.start_time.elapsed().as_secs_f64();
        if self.throughput_history.len() >= MAX_THROUGHPUT_POINTS {
            self.throughput_history.pop_front();
        }
        self.throughput_history
            .push_back((elapsed_secs, snapshot.total_bytes_encoded as f64 / (1024.0 * 1024.0)));

        self.metrics = Some(snapshot);
        self.connected = true;
    }
}

// ============================================================================
// Terminal Setup/Teardown
// ============================================================================

/// Initialize the terminal for TUI rendering
fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    Terminal::new(CrosstermBackend::new(stdout))
}

/// Restore terminal to normal state
fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;
    Ok(())
}

// ============================================================================
// Widget Rendering
// ============================================================================

fn status_color(status: &str) -> Color {
    match status {
        "success" => Color::Green,
        "fail" => Color::Red,
        "running" => Color::Cyan,
        _ => Color::Gray,
    }
}

/// Render the media table with encoding status
fn render_media_table(f: &mut Frame, area: Rect, app: &App) {
    let header_cells = ["ID", "Title", "Type", "Status", "Duration"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells).height(1).bottom_margin(1);

    let rows: Vec<Row> = app
        .media
        .iter()
        .map(|m| {
            Row::new(vec![
                Cell::from(m.id.clone()),
                Cell::from(m.title.clone()),
                Cell::from(m.media_type.clone().unwrap_or_else(|| "-".to_string())),
                Cell::from(m.encoding_status.clone())
                    .style(Style::default().fg(status_color(&m.encoding_status))),
                Cell::from(format_duration(m.duration)),
            ])
        })
        .collect();

    let widths = [
        Constraint::Length(14),
        Constraint::Min(20),
        Constraint::Length(7),
        Constraint::Length(9),
        Constraint::Length(10),
    ];

    let title = if app.connected {
        format!(" Media ({}) ", app.media.len())
    } else {
        " Media (Disconnected) ".to_string()
    };

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(table, area);
}

/// CPU and memory gauges above a load average line.
fn render_system(f: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Length(3), Constraint::Length(3)])
        .split(area);

    let system = app.metrics.as_ref().map(|m| m.system.clone()).unwrap_or_default();
    let gauges = [
        (" CPU ", system.cpu_usage_percent, Color::Cyan),
        (" Memory ", system.mem_usage_percent, Color::Magenta),
    ];
    for (i, (title, percent, color)) in gauges.into_iter().enumerate() {
        let ratio = (percent as f64 / 100.0).clamp(0.0, 1.0);
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title(title))
            .gauge_style(Style::default().fg(color))
            .ratio(ratio)
            .label(format!("{:.1}%", percent));
        f.render_widget(gauge, chunks[i]);
    }

    let load = Paragraph::new(format!(
        "{:.2}  {:.2}  {:.2}",
        system.load_avg_1, system.load_avg_5, system.load_avg_15
    ))
    .block(Block::default().borders(Borders::ALL).title(" Load 1/5/15 "));
    f.render_widget(load, chunks[2]);
}

/// Render dispatch, completion and race counters
fn render_pipeline_counters(f: &mut Frame, area: Rect, app: &App) {
    let m = app.metrics.clone().unwrap_or_default();
    let rows = vec![
        ("Dispatched", m.dispatched_jobs.to_string()),
        ("Succeeded", m.succeeded_jobs.to_string()),
        ("Failed", m.failed_jobs.to_string()),
        ("Chunk sets", m.chunk_sets_concatenated.to_string()),
        ("Duplicates", m.races_discarded.to_string()),
        ("Hook errors", m.hook_failures.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| Row::new(vec![Cell::from(k), Cell::from(v)]))
    .collect::<Vec<_>>();

    let table = Table::new(rows, [Constraint::Length(12), Constraint::Length(10)])
        .block(Block::default().borders(Borders::ALL).title(" Pipeline "));
    f.render_widget(table, area);
}

/// Render throughput chart showing MB encoded over time
fn render_throughput_chart(f: &mut Frame, area: Rect, app: &App) {
    let data: Vec<(f64, f64)> = app.throughput_history.iter().cloned().collect();
    let block = Block::default().borders(Borders::ALL).title(" Encoded (MB) ");
    if data.is_empty() {
        f.render_widget(block, area);
        return;
    }

    let min_x = data.first().map(|(x, _)| *x).unwrap_or(0.0);
    let max_x = data.last().map(|(x, _)| *x).unwrap_or(60.0).max(min_x + 1.0);
    let max_y = data.iter().map(|(_, y)| *y).fold(0.0f64, f64::max).max(1.0);

    let datasets = vec![Dataset::default()
        .name("MB")
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(Color::Green))
        .data(&data)];

    let chart = Chart::new(datasets)
        .block(block)
        .x_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds([min_x, max_x])
                .labels(vec![Span::raw(format!("{:.0}s", min_x)), Span::raw(format!("{:.0}s", max_x))]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, max_y])
                .labels(vec![Span::raw("0"), Span::raw(format!("{:.0}", max_y))]),
        );
    f.render_widget(chart, area);
}

/// Render event log showing recent counter changes
fn render_event_log(f: &mut Frame, area: Rect, app: &App) {
    let events: Vec<Line> = app
        .event_log
        .iter()
        .rev()
        .take(area.height.saturating_sub(2) as usize)
        .map(|e| Line::from(e.as_str()))
        .collect();

    let paragraph = Paragraph::new(events)
        .block(Block::default().borders(Borders::ALL).title(" Events "))
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

/// Render status bar with queue and running counts
fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let status = match &app.metrics {
        Some(m) => format!(
            " Queue: {} | Running: {} | Encoded: {:.2} GB | Press 'q' to quit ",
            m.queue_len,
            m.running_jobs,
            m.total_bytes_encoded as f64 / (1024.0 * 1024.0 * 1024.0)
        ),
        None => " Connecting to daemon... | Press 'q' to quit ".to_string(),
    };
    let paragraph = Paragraph::new(status).style(Style::default().fg(Color::White).bg(Color::DarkGray));
    f.render_widget(paragraph, area);
}

/// Format duration in seconds to human-readable string
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

// ============================================================================
// Main UI Layout
// ============================================================================

/// Render the complete UI layout
fn ui(f: &mut Frame, app: &App) {
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(f.area());

    let content_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
        .split(main_chunks[0]);

    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
        .split(content_chunks[0]);

    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(9), Constraint::Length(8), Constraint::Min(0)])
        .split(content_chunks[1]);

    render_media_table(f, left_chunks[0], app);
    render_event_log(f, left_chunks[1], app);
    render_system(f, right_chunks[0], app);
    render_pipeline_counters(f, right_chunks[1], app);
    render_throughput_chart(f, right_chunks[2], app);
    render_status_bar(f, main_chunks[1], app);
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> io::Result<()> {
    let base_url = std::env::var("ETOP_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let mut terminal = setup_terminal()?;

    let mut app = App::new(base_url);
    app.log_event("etop started".to_string());

    let result = run_app(&mut terminal, &mut app).await;
    restore_terminal(&mut terminal)?;
    result
}

/// Main application loop
async fn run_app(terminal: &mut Terminal<CrosstermBackend<Stdout>>, app: &mut App) -> io::Result<()> {
    let poll_interval = Duration::from_millis(POLL_INTERVAL_MS);
    let mut last_fetch: Option<Instant> = None;

    loop {
        if last_fetch.map_or(true, |t| t.elapsed() >= poll_interval) {
            app.refresh().await;
            last_fetch = Some(Instant::now());
        }

        terminal.draw(|f| ui(f, app))?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press
                    && matches!(key.code, KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc)
                {
                    return Ok(());
                }
            }
        }
    }
}
