//! Outbound command frames and the sinks that carry them to a transport.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::trace;
use viz_proto::{encode_command_json, ClientCommand, KeyPayload};

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("command channel closed")]
    Closed,
}

/// Anything that can forward an encoded frame towards the server.
pub trait CommandSink {
    fn send_frame(&mut self, frame: String) -> Result<(), EmitError>;
}

impl CommandSink for crossbeam_channel::Sender<String> {
    fn send_frame(&mut self, frame: String) -> Result<(), EmitError> {
        self.send(frame).map_err(|_| EmitError::Closed)
    }
}

impl CommandSink for Vec<String> {
    fn send_frame(&mut self, frame: String) -> Result<(), EmitError> {
        self.push(frame);
        Ok(())
    }
}

#[derive(Debug)]
pub struct CommandEmitter<S> {
    sink: S,
}

impl<S: CommandSink> CommandEmitter<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn request_step(&mut self, step: u64) -> Result<(), EmitError> {
        self.emit(&ClientCommand::Step { step })
    }

    pub fn request_reset(&mut self) -> Result<(), EmitError> {
        self.emit(&ClientCommand::Reset {})
    }

    pub fn request_method_call(
        &mut self,
        replica: usize,
        data: Map<String, Value>,
    ) -> Result<(), EmitError> {
        self.emit(&ClientCommand::CallMethod {
            model_id: replica,
            data,
        })
    }

    pub fn request_key_event(
        &mut self,
        replica: usize,
        key: impl Into<String>,
    ) -> Result<(), EmitError> {
        self.emit(&ClientCommand::KeyPress {
            model_id: replica,
            data: KeyPayload { key: key.into() },
        })
    }

    fn emit(&mut self, command: &ClientCommand) -> Result<(), EmitError> {
        let frame = encode_command_json(command)?;
        trace!(kind = command.kind(), %frame, "command.emitted");
        self.sink.send_frame(frame)
    }
}
