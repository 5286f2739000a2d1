//! Message passthrough

use crate::runtime::{
    BlockRet, Message, MessagePorts, Signature, StreamBlock, StreamInput, StreamOutput, WorkResult,
};

/// Forwards every message from its `in` port to its `out` port
pub struct MessageCopy;

impl StreamBlock for MessageCopy {
    fn name(&self) -> &str {
        "message_copy"
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

    fn message_outputs(&self) -> &[&str] {
        &["out"]
    }

    fn handle_message(
        &mut self,
        _port: usize,
        msg: Message,
        msgs: &mut MessagePorts,
    ) -> WorkResult {
        msgs.post(0, msg);
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
