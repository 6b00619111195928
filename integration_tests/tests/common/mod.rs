#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::{json, Value};
use timeline_core::{ViewerConfig, ViewerSession};
use viz_proto::{
    decode_command_json, encode_server_message_json, ClientCommand, EncodedJson, ServerMessage,
};

static INIT: Once = Once::new();

pub fn ensure_test_config() {
    INIT.call_once(|| {
        let config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join("test_viewer_config.json");

        debug_assert!(
            config_path.exists(),
            "missing test viewer config at {}",
            config_path.display()
        );

        std::env::set_var(timeline_core::VIEWER_CONFIG_ENV, &config_path);
    });
}

pub fn test_config() -> ViewerConfig {
    ensure_test_config();
    timeline_core::load_viewer_config_from_env().0
}

pub type TestSession = ViewerSession<Sender<String>>;

/// Session wired to a channel the test reads outbound commands from.
pub fn connected_session() -> (TestSession, Receiver<String>) {
    let (sender, receiver) = unbounded();
    let mut session = ViewerSession::new(test_config(), sender);
    session.on_connected();
    (session, receiver)
}

pub fn drain_commands(receiver: &Receiver<String>) -> Vec<ClientCommand> {
    receiver
        .try_iter()
        .map(|frame| decode_command_json(&frame).expect("outbound frame decodes"))
        .collect()
}

pub fn replica_state(x: i64) -> Value {
    json!({
        "running": true,
        "x": x,
        "agents": [{"unique_id": 1, "pos": [x, 0]}]
    })
}

pub fn model_state(step: u64, xs: &[i64]) -> String {
    let message = ServerMessage::ModelState {
        step,
        data: xs.iter().map(|x| EncodedJson::from(replica_state(*x))).collect(),
    };
    encode_server_message_json(&message).expect("model_state encodes")
}

pub fn chart_specs(n_sims: usize) -> String {
    let spec = json!({"mark": "line", "encoding": {"y": {"field": "x"}}});
    let message = ServerMessage::VegaSpecs {
        data: vec![EncodedJson::from(spec)],
        n_sims: Some(n_sims),
    };
    encode_server_message_json(&message).expect("vega_specs encodes")
}

/// In-process stand-in for the visualization server: answers `reset`,
/// `step` and `call_method` the way a real server does, with
/// `x = 10 * step + replica` unless overridden by a method call.
pub struct ScriptedServer {
    n_sims: usize,
    current: u64,
    overrides: Vec<Option<i64>>,
    max_steps: Option<u64>,
}

impl ScriptedServer {
    pub fn new(n_sims: usize) -> Self {
        Self {
            n_sims,
            current: 0,
            overrides: vec![None; n_sims],
            max_steps: None,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Frames sent when a client socket opens.
    pub fn on_open(&self) -> Vec<String> {
        vec![chart_specs(self.n_sims)]
    }

    pub fn state_for(&self, step: u64) -> String {
        let xs: Vec<i64> = (0..self.n_sims)
            .map(|replica| {
                self.overrides[replica].unwrap_or(10 * step as i64 + replica as i64)
            })
            .collect();
        model_state(step, &xs)
    }

    pub fn respond(&mut self, command: &ClientCommand) -> Vec<String> {
        match command {
            ClientCommand::Reset {} => {
                self.current = 0;
                self.overrides = vec![None; self.n_sims];
                vec![
                    json!({"type": "model_params", "params": [{"name": "density"}]}).to_string(),
                    self.state_for(0),
                ]
            }
            ClientCommand::Step { step } => {
                if self.max_steps.is_some_and(|max| *step > max) {
                    return vec![json!({"type": "end", "data": {}}).to_string()];
                }
                self.current = *step;
                self.overrides = vec![None; self.n_sims];
                vec![self.state_for(*step)]
            }
            ClientCommand::CallMethod { model_id, data } => {
                if let Some(x) = data.get("x").and_then(Value::as_i64) {
                    self.overrides[*model_id] = Some(x);
                }
                vec![self.state_for(self.current)]
            }
            ClientCommand::KeyPress { .. } => vec![self.state_for(self.current)],
        }
    }

    /// Answer every queued command, feeding responses into the session.
    /// Returns how many commands were answered.
    pub fn serve(&mut self, session: &mut TestSession, commands: &Receiver<String>) -> usize {
        let pending = drain_commands(commands);
        for command in &pending {
            for frame in self.respond(command) {
                session.dispatch(&frame);
            }
        }
        pending.len()
    }

    pub fn open(&self, session: &mut TestSession) {
        for frame in self.on_open() {
            session.dispatch(&frame);
        }
    }
}

pub fn x_series(session: &TestSession, replica: usize, step: u64) -> Vec<Option<f64>> {
    session
        .timeline()
        .store()
        .get_by_step(replica, step)
        .and_then(|entity| entity.series().numeric("x"))
        .expect("series present")
}
