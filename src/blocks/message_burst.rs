//! Message source emitting a fixed number of messages

use crate::runtime::{
    BlockRet, Message, MessagePorts, Signature, StreamBlock, StreamInput, StreamOutput, WorkResult,
};

/// Posts `count` copies of a message on its `out` port, one per invocation,
/// then finishes
pub struct MessageBurst {
    msg: Message,
    remaining: u64,
}

impl MessageBurst {
    pub fn new(msg: Message, count: u64) -> Self {
        Self {
            msg,
            remaining: count,
        }
    }
}

impl StreamBlock for MessageBurst {
    fn name(&self) -> &str {
        "message_burst"
    }

    fn input_signature(&self) -> Signature {
        Signature::none()
    }

    fn output_signature(&self) -> Signature {
        Signature::none()
    }

    fn message_outputs(&self) -> &[&str] {
        &["out"]
    }

    fn work(
        &mut self,
        _inputs: &[StreamInput],
        _outputs: &mut [StreamOutput],
        msgs: &mut MessagePorts,
    ) -> WorkResult<BlockRet> {
        if self.remaining == 0 {
            return Ok(BlockRet::Done);
        }
        msgs.post(0, self.msg.clone());
        self.remaining -= 1;
        if self.remaining == 0 {
            Ok(BlockRet::Done)
        } else {
            Ok(BlockRet::Ok)
        }
    }
}
