use std::collections::VecDeque;

use ratatui::layout::{Constraint, Direction, Layout, Margin};
use ratatui::prelude::Rect;
use ratatui::style::{Color, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Sparkline, Wrap};
use ratatui::Frame;

use timeline_core::{CommandSink, ConnectionState, SimulationStep, ViewerSession};

pub struct UiState {
    pub logs: VecDeque<String>,
    pub max_logs: usize,
    pub selected_replica: usize,
    pub selected_field: usize,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            logs: VecDeque::new(),
            max_logs: 8,
            selected_replica: 0,
            selected_field: 0,
        }
    }
}

impl UiState {
    pub fn push_log<S: Into<String>>(&mut self, line: S) {
        let mut text: String = line.into();
        while text.ends_with('\n') || text.ends_with('\r') {
            text.pop();
        }
        if text.is_empty() {
            return;
        }
        self.logs.push_front(text);
        while self.logs.len() > self.max_logs {
            self.logs.pop_back();
        }
    }

    pub fn next_replica(&mut self, replicas: usize) {
        self.selected_replica = if replicas == 0 {
            0
        } else {
            (self.selected_replica + 1) % replicas
        };
    }

    pub fn next_field(&mut self, fields: usize) {
        self.selected_field = if fields == 0 {
            0
        } else {
            (self.selected_field + 1) % fields
        };
    }

    /// Keep the selection valid after the run changed shape.
    pub fn clamp_to(&mut self, replicas: usize) {
        if self.selected_replica >= replicas {
            self.selected_replica = 0;
        }
    }
}

pub fn draw_ui<S: CommandSink>(frame: &mut Frame, state: &UiState, session: &ViewerSession<S>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(6),
            Constraint::Length(10),
            Constraint::Min(6),
        ])
        .split(frame.size());

    draw_header(frame, chunks[0], session);
    draw_controls(frame, chunks[1]);
    draw_logs(frame, chunks[2], state);
    draw_replica(frame, chunks[3], state, session);
}

fn cursor_label(step: Option<u64>) -> String {
    step.map_or_else(|| "-".to_string(), |step| step.to_string())
}

fn draw_header<S: CommandSink>(frame: &mut Frame, area: Rect, session: &ViewerSession<S>) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Simulation Step Viewer");
    let timeline = session.timeline();
    let connection = match session.connection() {
        ConnectionState::Connected => Span::styled("Connected", Style::default().fg(Color::Green)),
        ConnectionState::Disconnected => {
            Span::styled("Disconnected", Style::default().fg(Color::Red))
        }
    };
    let run = if !timeline.is_ready() {
        "no run"
    } else if timeline.run_ended() {
        "ended"
    } else if session.is_playing() {
        "playing"
    } else {
        "paused"
    };
    let mut spans = vec![
        connection,
        Span::raw(format!(
            " | run {} ({} replicas) | display ",
            timeline.generation(),
            timeline.replica_count()
        )),
        Span::styled(
            cursor_label(timeline.display_step()),
            Style::default().fg(Color::Yellow),
        ),
        Span::raw(" / live "),
        Span::styled(
            cursor_label(timeline.live_step()),
            Style::default().fg(Color::Cyan),
        ),
        Span::raw(format!(
            " | {} | {:.2}s",
            run,
            session.playback_interval().as_secs_f32()
        )),
    ];
    if let Some(step) = session.pending_step() {
        spans.push(Span::styled(
            format!(" | awaiting {step}"),
            Style::default().fg(Color::Magenta),
        ));
    }
    let text = Paragraph::new(Line::from(spans)).wrap(Wrap { trim: true });
    frame.render_widget(block, area);
    frame.render_widget(
        text,
        area.inner(&Margin {
            vertical: 1,
            horizontal: 1,
        }),
    );
}

fn draw_controls(frame: &mut Frame, area: Rect) {
    let key = |label: &'static str| Span::styled(label, Style::default().fg(Color::Yellow));
    let lines = vec![
        Line::from(vec![
            key("space"),
            Span::raw(" play/pause   "),
            key(". →"),
            Span::raw(" step   "),
            key(", ←"),
            Span::raw(" back   "),
            key("g"),
            Span::raw(" live"),
        ]),
        Line::from(vec![
            key("r"),
            Span::raw(" reset   "),
            key("[ ]"),
            Span::raw(" slower/faster   "),
            key("tab"),
            Span::raw(" replica   "),
            key("f"),
            Span::raw(" field"),
        ]),
        Line::from(vec![
            key("↑ ↓"),
            Span::raw(" send key to replica   "),
            key("q"),
            Span::raw(" exit viewer"),
        ]),
    ];
    let block = Block::default().borders(Borders::ALL).title("Controls");
    let paragraph = Paragraph::new(lines).wrap(Wrap { trim: false });
    frame.render_widget(block, area);
    frame.render_widget(
        paragraph,
        area.inner(&Margin {
            vertical: 1,
            horizontal: 1,
        }),
    );
}

fn draw_logs(frame: &mut Frame, area: Rect, state: &UiState) {
    let block = Block::default().borders(Borders::ALL).title("Logs");
    let lines: Vec<Line> = state
        .logs
        .iter()
        .map(|entry| Line::from(Span::raw(entry)))
        .collect();
    let paragraph = Paragraph::new(lines).wrap(Wrap { trim: false });
    frame.render_widget(block, area);
    frame.render_widget(
        paragraph,
        area.inner(&Margin {
            vertical: 1,
            horizontal: 1,
        }),
    );
}

fn draw_replica<S: CommandSink>(
    frame: &mut Frame,
    area: Rect,
    state: &UiState,
    session: &ViewerSession<S>,
) {
    let replica = state.selected_replica;
    let Some(entity) = session.displayed(replica) else {
        let block = Block::default().borders(Borders::ALL).title("Replica");
        let paragraph = Paragraph::new("Waiting for the first step...");
        frame.render_widget(block, area);
        frame.render_widget(
            paragraph,
            area.inner(&Margin {
                vertical: 1,
                horizontal: 1,
            }),
        );
        return;
    };

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(area);

    draw_scalars(frame, columns[0], replica, entity, state.selected_field);
    draw_series(frame, columns[1], entity, state.selected_field);
}

fn draw_scalars(
    frame: &mut Frame,
    area: Rect,
    replica: usize,
    entity: &SimulationStep,
    selected_field: usize,
) {
    let block = Block::default().borders(Borders::ALL).title(format!(
        "Replica {replica} @ step {} | {} agents",
        entity.step(),
        entity.agents().len()
    ));
    let lines: Vec<Line> = field_rows(entity)
        .into_iter()
        .enumerate()
        .map(|(index, (name, value))| {
            let style = if index == selected_field {
                Style::default().fg(Color::Yellow)
            } else {
                Style::default()
            };
            Line::from(vec![
                Span::styled(format!("{name:<16}"), style),
                Span::styled(value, Style::default().fg(Color::Cyan)),
            ])
        })
        .collect();
    let paragraph = Paragraph::new(lines).wrap(Wrap { trim: false });
    frame.render_widget(block, area);
    frame.render_widget(
        paragraph,
        area.inner(&Margin {
            vertical: 1,
            horizontal: 1,
        }),
    );
}

/// One row per series field, in the order the sparkline indexes them. Fields
/// missing from this step show as `-`.
fn field_rows(entity: &SimulationStep) -> Vec<(&str, String)> {
    entity
        .series()
        .field_names()
        .map(|name| {
            let value = entity
                .model()
                .scalar(name)
                .map_or_else(|| "-".to_string(), |value| value.to_string());
            (name.as_str(), value)
        })
        .collect()
}

fn draw_series(frame: &mut Frame, area: Rect, entity: &SimulationStep, selected_field: usize) {
    let series = entity.series();
    let name = series.field_names().nth(selected_field).cloned();
    let values = name
        .as_deref()
        .and_then(|name| series.numeric(name))
        .unwrap_or_default();
    let width = usize::from(area.width.saturating_sub(2));
    let points = sparkline_points(&values, width);
    let title = match &name {
        Some(name) => format!("{name} ({} steps)", series.len()),
        None => "series".to_string(),
    };
    let sparkline = Sparkline::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .data(&points)
        .style(Style::default().fg(Color::Green));
    frame.render_widget(sparkline, area);
}

/// Scale the most recent `width` values into sparkline bars. Placeholders
/// render as empty bars.
fn sparkline_points(values: &[Option<f64>], width: usize) -> Vec<u64> {
    let start = values.len().saturating_sub(width);
    let window = &values[start..];
    let (min, max) = window
        .iter()
        .flatten()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), value| {
            (min.min(*value), max.max(*value))
        });
    let span = max - min;
    window
        .iter()
        .map(|value| match value {
            Some(value) if span > 0.0 => (((value - min) / span) * 99.0) as u64 + 1,
            Some(_) => 50,
            None => 0,
        })
        .collect()
}
