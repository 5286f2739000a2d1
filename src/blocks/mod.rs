//! Utility blocks exercising the runtime contract
//!
//! Sources, sinks, rate changers, and message blocks used by the demos and
//! the scheduler tests. Each is an ordinary [`StreamBlock`](crate::runtime::StreamBlock)
//! with no special standing in the runtime.

mod apply;
pub use apply::Apply;

mod copy;
pub use copy::Copy;

mod head;
pub use head::Head;

mod keep_one_in_n;
pub use keep_one_in_n::KeepOneInN;

mod message_burst;
pub use message_burst::MessageBurst;

mod message_copy;
pub use message_copy::MessageCopy;

mod message_sink;
pub use message_sink::MessageSink;

mod null_sink;
pub use null_sink::NullSink;

mod null_source;
pub use null_source::NullSource;

mod stream_to_streams;
pub use stream_to_streams::StreamToStreams;

mod stream_to_vector;
pub use stream_to_vector::StreamToVector;

mod vector_sink;
pub use vector_sink::VectorSink;

mod vector_source;
pub use vector_source::VectorSource;

mod vector_to_stream;
pub use vector_to_stream::VectorToStream;
