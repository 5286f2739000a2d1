//! Sink collecting received messages for inspection

use std::sync::{Arc, Mutex};

use crate::runtime::{
    BlockRet, Message, MessagePorts, Signature, StreamBlock, StreamInput, StreamOutput, WorkResult,
};

/// Appends every message received on its `in` port to a shared vector
pub struct MessageSink {
    received: Arc<Mutex<Vec<Message>>>,
}

impl MessageSink {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the collected messages.
    pub fn received(&self) -> Arc<Mutex<Vec<Message>>> {
        Arc::clone(&self.received)
    }
}

impl StreamBlock for MessageSink {
    fn name(&self) -> &str {
        "message_sink"
    }

    fn input_signature(&self) -> Signature {
        Signature::none()
    }

    fn output_signature(&self) -> Signature {
        Signature::none()
    }

    fn message_inputs(&self) -> &[&str] {
        &["in"]
    }

    fn handle_message(
        &mut self,
        _port: usize,
        msg: Message,
        _msgs: &mut MessagePorts,
    ) -> WorkResult {
        self.received.lock().unwrap().push(msg);
        Ok(())
    }

    fn work(
        &mut self,
        _inputs: &[StreamInput],
        _outputs: &mut [StreamOutput],
        _msgs: &mut MessagePorts,
    ) -> WorkResult<BlockRet> {
        // All activity happens in the handler.
        Ok(BlockRet::InsufficientInput)
    }
}
