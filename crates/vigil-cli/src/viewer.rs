use std::io;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::Terminal;
use vigil_core::{Alert, CameraStatus, Pipeline};

const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

struct ViewerState {
    statuses: Vec<CameraStatus>,
    alerts: Vec<Alert>,
    active: usize,
}

pub async fn run_viewer(pipeline: &Pipeline, alert_rows: usize) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut state = ViewerState {
        statuses: Vec::new(),
        alerts: Vec::new(),
        active: 0,
    };
    let mut next_refresh = Instant::now();

    let run_result = async {
        loop {
            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    match key.code {
                        KeyCode::Char('q') => break,
                        KeyCode::Char('a') => {
                            let newest_open = state.alerts.iter().find(|a| !a.acknowledged);
                            if let Some(alert) = newest_open {
                                pipeline.coordinator().acknowledge(alert.id).await;
                                next_refresh = Instant::now();
                            }
                        }
                        _ => {}
                    }
                }
            }

            if Instant::now() >= next_refresh {
                state.statuses = pipeline.camera_statuses().await;
                state.alerts = pipeline.coordinator().recent_alerts(alert_rows).await;
                state.active = pipeline.coordinator().active_alert_count().await;
                next_refresh = Instant::now() + REFRESH_INTERVAL;
            }

            terminal.draw(|frame| draw_ui(frame.size(), frame, &state))?;
        }

        Ok::<(), anyhow::Error>(())
    }
    .await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    run_result
}

fn draw_ui(area: Rect, frame: &mut ratatui::Frame<'_>, state: &ViewerState) {
    let camera_rows = (state.statuses.len() as u16).saturating_add(2);
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(camera_rows),
            Constraint::Min(0),
        ])
        .split(area);

    frame.render_widget(render_header(state), rows[0]);
    frame.render_widget(render_cameras(state), rows[1]);
    frame.render_widget(render_alerts(state), rows[2]);
}

fn render_header(state: &ViewerState) -> Paragraph<'static> {
    let online = state.statuses.iter().filter(|s| s.connected).count();
    let summary = format!(
        "cameras {}/{} online  unacknowledged alerts {}  (press 'q' to quit, 'a' to acknowledge)",
        online,
        state.statuses.len(),
        state.active
    );

    let line = Line::from(vec![
        Span::styled(
            "Vigil Live View  ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::raw(summary),
    ]);

    Paragraph::new(vec![line]).block(Block::default().borders(Borders::ALL).title("Status"))
}

fn render_cameras(state: &ViewerState) -> Paragraph<'static> {
    let mut lines = Vec::new();
    if state.statuses.is_empty() {
        lines.push(Line::from("Waiting for first status refresh..."));
    }
    for status in &state.statuses {
        let (marker, color) = if status.connected {
            ("online ", Color::Green)
        } else {
            ("offline", Color::Red)
        };
        lines.push(Line::from(vec![
            Span::styled(format!("{marker}  "), Style::default().fg(color)),
            Span::raw(format!(
                "{:<10} {:<24} {:>6.1} fps",
                status.id, status.name, status.fps
            )),
        ]));
    }

    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Cameras"))
}

fn render_alerts(state: &ViewerState) -> Paragraph<'static> {
    let mut lines = Vec::new();
    if state.alerts.is_empty() {
        lines.push(Line::from("No alerts"));
    }
    for alert in &state.alerts {
        let style = if alert.acknowledged {
            Style::default().fg(Color::DarkGray)
        } else {
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD)
        };
        let ack = if alert.acknowledged { "ack" } else { "NEW" };
        lines.push(Line::from(Span::styled(
            format!(
                "#{:<5} {} [{ack}] {} {} confidence={:.2}",
                alert.id,
                alert.created_at.format("%H:%M:%S"),
                alert.camera_name,
                alert.threat_class,
                alert.confidence
            ),
            style,
        )));
    }

    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Recent Alerts"))
}
