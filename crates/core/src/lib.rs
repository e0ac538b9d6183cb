//! Channel resolution, live message ordering and automated reply orchestration.

pub mod channel;
pub mod error;
pub mod message;
pub mod reply;
pub mod session;
pub mod stream;

pub use channel::{
    ASSISTANT_CHANNEL_PREFIX, Channel, ChannelKind, ChannelResolver, DIRECT_CHANNEL_PREFIX,
};
pub use error::{CoreError, CoreResult};
pub use message::{Message, order_by_effective_timestamp};
pub use reply::{
    DEFAULT_CONTEXT_WINDOW, ReplyAttemptId, ReplyCompletion, ReplyOrchestrator, ReplyOutcome,
    ReplyPolicy, ReplyState, render_context_lines,
};
pub use session::{ActiveChannel, SessionContext, SessionEvent};
pub use stream::{MessageStream, StreamError, StreamEvent, StreamUpdate, SubscriptionGeneration};
