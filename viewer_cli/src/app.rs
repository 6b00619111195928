use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use color_eyre::Result;
use crossterm::event::{self, Event, KeyCode};
use ratatui::backend::CrosstermBackend;
use ratatui::prelude::*;
use timeline_core::{
    AdvanceResult, CommandSink, DispatchOutcome, EmitError, SessionEvent, StepOutcome,
    ViewerConfig, ViewerSession,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{info, trace, warn};

use crate::ui::{draw_ui, UiState};

/// What the websocket task reports to the UI thread.
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    Frame(String),
    Disconnected,
}

/// Outbound frames queued for the websocket task.
#[derive(Debug, Clone)]
pub struct OutboundSink(UnboundedSender<String>);

impl CommandSink for OutboundSink {
    fn send_frame(&mut self, frame: String) -> std::result::Result<(), EmitError> {
        self.0.send(frame).map_err(|_| EmitError::Closed)
    }
}

pub fn channel() -> (UnboundedSender<TransportEvent>, UnboundedReceiver<TransportEvent>) {
    unbounded_channel()
}

pub fn outbound_channel() -> (OutboundSink, UnboundedReceiver<String>) {
    let (sender, receiver) = unbounded_channel();
    (OutboundSink(sender), receiver)
}

pub struct ViewerApp {
    terminal: Terminal<CrosstermBackend<std::io::Stdout>>,
    ui_state: UiState,
    session: ViewerSession<OutboundSink>,
    transport: UnboundedReceiver<TransportEvent>,
    shutdown_sender: UnboundedSender<()>,
    log_receiver: Receiver<String>,
}

impl ViewerApp {
    pub fn new(
        config: ViewerConfig,
        sink: OutboundSink,
        transport: UnboundedReceiver<TransportEvent>,
        shutdown_sender: UnboundedSender<()>,
        log_receiver: Receiver<String>,
    ) -> Result<Self> {
        let stdout = std::io::stdout();
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        crossterm::terminal::enable_raw_mode()?;
        terminal.clear()?;
        terminal.hide_cursor()?;
        Ok(Self {
            terminal,
            ui_state: UiState::default(),
            session: ViewerSession::new(config, sink),
            transport,
            shutdown_sender,
            log_receiver,
        })
    }

    pub fn run(mut self) -> Result<()> {
        let mut last_draw = Instant::now();

        loop {
            while let Ok(event) = self.transport.try_recv() {
                self.on_transport_event(event);
            }

            while let Ok(line) = self.log_receiver.try_recv() {
                self.ui_state.push_log(line);
            }

            if let Some(result) = self.session.tick(Instant::now()) {
                trace!(?result, "playback.tick");
            }
            self.drain_session_events();

            if last_draw.elapsed() >= Duration::from_millis(100) {
                self.terminal
                    .draw(|frame| draw_ui(frame, &self.ui_state, &self.session))?;
                last_draw = Instant::now();
            }

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => break,
                        KeyCode::Char(' ') => {
                            let state = self.session.toggle_playback(Instant::now());
                            self.ui_state.push_log(format!("Playback {state:?}"));
                        }
                        KeyCode::Char('.') | KeyCode::Right => {
                            let result = self.session.advance(Instant::now());
                            self.report_advance(result);
                        }
                        KeyCode::Char(',') | KeyCode::Left => {
                            if let Err(err) = self.session.step_back() {
                                warn!("Cannot step back: {}", err);
                            }
                        }
                        KeyCode::Char('g') => match self.session.jump_to_live() {
                            Ok(step) => trace!(step, "display.jumped_to_live"),
                            Err(err) => warn!("Cannot jump to live: {}", err),
                        },
                        KeyCode::Char('r') => {
                            if self.session.reset() {
                                info!("Requested a new run");
                            } else {
                                warn!("Reset queued until the server is reachable");
                            }
                        }
                        KeyCode::Char(']') | KeyCode::Char('}') => {
                            self.adjust_playback_interval(0.75);
                        }
                        KeyCode::Char('[') | KeyCode::Char('{') => {
                            self.adjust_playback_interval(1.25);
                        }
                        KeyCode::Tab => {
                            let replicas = self.session.timeline().replica_count();
                            self.ui_state.next_replica(replicas);
                        }
                        KeyCode::Char('f') => {
                            let fields = self
                                .session
                                .displayed(self.ui_state.selected_replica)
                                .map_or(0, |entity| entity.series().field_names().count());
                            self.ui_state.next_field(fields);
                        }
                        KeyCode::Up => self.send_key("ArrowUp"),
                        KeyCode::Down => self.send_key("ArrowDown"),
                        _ => {}
                    }
                }
            }
        }

        self.terminal.show_cursor()?;
        crossterm::terminal::disable_raw_mode()?;
        let _ = self.shutdown_sender.send(());
        Ok(())
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.session.on_connected(),
            TransportEvent::Disconnected => self.session.on_disconnected(),
            TransportEvent::Frame(text) => match self.session.dispatch(&text) {
                DispatchOutcome::Step(StepOutcome::Redelivered {
                    step,
                    changed: true,
                }) => {
                    self.ui_state
                        .push_log(format!("Step {step} updated by the server"));
                }
                DispatchOutcome::RunInitialized { replicas, .. } => {
                    self.ui_state.clamp_to(replicas);
                }
                DispatchOutcome::ChartSpecs { count } => {
                    self.ui_state.clamp_to(self.session.timeline().replica_count());
                    trace!(count, "chart_specs.received");
                }
                DispatchOutcome::Rejected(err) => {
                    self.ui_state.push_log(format!("Dropped frame: {err}"));
                }
                _ => {}
            },
        }
    }

    fn drain_session_events(&mut self) {
        for event in self.session.take_events() {
            let line = match event {
                SessionEvent::RunStarted {
                    replicas,
                    generation,
                } => format!("Run {generation} started with {replicas} replicas"),
                SessionEvent::RunEnded { live_step } => match live_step {
                    Some(step) => format!("Run ended at step {step}"),
                    None => "Run ended".to_string(),
                },
                SessionEvent::RequestRetried { step } => format!("Retrying step {step}"),
                SessionEvent::StepTimedOut { step } => {
                    format!("Step {step} timed out; playback stopped")
                }
                SessionEvent::ConnectionChanged(state) => format!("Connection {state:?}"),
                SessionEvent::CommandFailed { kind, error } => {
                    format!("Failed to send {kind}: {error}")
                }
            };
            self.ui_state.push_log(line);
        }
    }

    fn report_advance(&mut self, result: AdvanceResult) {
        match result {
            AdvanceResult::Moved(step) => trace!(step, "Manual step"),
            AdvanceResult::Requested(step) => trace!(step, "Requested step from server"),
            AdvanceResult::AwaitingStep(step) => {
                self.ui_state
                    .push_log(format!("Still waiting for step {step}"));
            }
            AdvanceResult::Offline => self.ui_state.push_log("Not connected"),
            AdvanceResult::Exhausted => self.ui_state.push_log("Run has ended"),
            AdvanceResult::NotReady => self.ui_state.push_log("No run yet"),
        }
    }

    fn adjust_playback_interval(&mut self, factor: f32) {
        let current = self.session.playback_interval().as_secs_f32();
        let mut new_value = current * factor;
        if !new_value.is_finite() || new_value <= 0.0 {
            new_value = 0.05;
        }
        let applied = self
            .session
            .set_playback_interval(Duration::from_secs_f64(new_value as f64));
        self.ui_state.push_log(format!(
            "Playback interval set to {:.2}s",
            applied.as_secs_f32()
        ));
    }

    fn send_key(&mut self, key: &str) {
        let replica = self.ui_state.selected_replica;
        match self.session.key_event(replica, key) {
            Ok(()) => trace!(replica, key, "key_press.sent"),
            Err(err) => warn!("Failed to send key {}: {}", key, err),
        }
    }
}
