use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::agents::names::COORDINATOR;
use crate::core::errors::{Result, StageError};
use crate::pubsub::bus::panic_message;
use crate::pubsub::{
    ErrorReport, Message, MessageBus, MessageHandler, MessageKind, Payload, WeakMessageBus,
};

/// A pipeline stage.
///
/// Agents are pure message transformers: they receive one accepted message
/// and return the single follow-up to publish. Publishing, error conversion
/// and trace checks are done by [`StageHandler`].
#[async_trait]
pub trait StageAgent: Send + Sync + 'static {
    /// Receiver name the agent subscribes under
    fn name(&self) -> &'static str;

    /// Message kinds the agent handles; anything else is ignored
    fn accepts(&self) -> &'static [MessageKind];

    /// Processes `message` and returns its follow-up, built with
    /// [`Message::follow_up`]
    async fn process(&self, message: &Message) -> std::result::Result<Message, StageError>;
}

/// Bus handler wrapping a [`StageAgent`].
///
/// Guarantees exactly one follow-up per accepted message. Failures and panics
/// inside the agent become an `error` message to the coordinator carrying the
/// trigger's trace, so nothing escapes past the stage.
pub struct StageHandler<A> {
    agent: Arc<A>,
    bus: WeakMessageBus,
}

impl<A: StageAgent> StageHandler<A> {
    pub fn new(agent: Arc<A>, bus: &MessageBus) -> Self {
        Self {
            agent,
            bus: bus.downgrade(),
        }
    }

    /// Subscribes `agent` on `bus` under its own name
    pub fn register(agent: Arc<A>, bus: &MessageBus) -> Result<()> {
        let name = agent.name();
        bus.subscribe(name, Arc::new(Self::new(agent, bus)))
    }

    /// Runs the agent on `message` and returns the follow-up to publish, or
    /// `None` when the agent does not accept the message kind.
    pub async fn respond(&self, message: &Message) -> Option<Message> {
        let name = self.agent.name();
        if !self.agent.accepts().contains(&message.kind()) {
            debug!(
                agent = name,
                kind = %message.kind(),
                trace = %message.trace(),
                "Ignoring message"
            );
            return None;
        }

        debug!(
            agent = name,
            kind = %message.kind(),
            trace = %message.trace(),
            "Processing message"
        );
        let outcome = AssertUnwindSafe(self.agent.process(message))
            .catch_unwind()
            .await;

        let reply = match outcome {
            Ok(Ok(reply)) => match check_continuity(name, message, &reply) {
                Ok(()) => reply,
                Err(e) => {
                    error!(
                        agent = name,
                        trace = %message.trace(),
                        error = %e,
                        "Follow-up broke the trace chain"
                    );
                    error_reply(message, name, e.message(), e.category())
                }
            },
            Ok(Err(e)) => {
                warn!(agent = name, trace = %message.trace(), error = %e, "Stage failed");
                error_reply(message, name, e.message(), e.category())
            }
            Err(panic) => {
                let text = panic_message(panic.as_ref());
                error!(agent = name, trace = %message.trace(), panic = %text, "Stage panicked");
                error_reply(message, name, &text, "panic")
            }
        };
        Some(reply)
    }
}

#[async_trait]
impl<A: StageAgent> MessageHandler for StageHandler<A> {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let Some(reply) = self.respond(message).await else {
            return Ok(());
        };
        let bus = self.bus.upgrade().ok_or_else(|| {
            anyhow::anyhow!("bus dropped before {} could reply", reply.sender())
        })?;
        bus.publish(reply);
        Ok(())
    }
}

fn check_continuity(
    agent: &str,
    trigger: &Message,
    reply: &Message,
) -> std::result::Result<(), StageError> {
    let trace = trigger.trace();
    if reply.trace() != trace {
        return Err(StageError::protocol(format!(
            "{agent} replied under trace {} to a message of trace {trace}",
            reply.trace()
        )));
    }
    if let Some(embedded) = reply.payload().embedded_trace() {
        if embedded != trace {
            return Err(StageError::protocol(format!(
                "{agent} embedded trace {embedded} in a reply for trace {trace}"
            )));
        }
    }
    Ok(())
}

/// `error` message for the coordinator answering `trigger`
pub fn error_reply(trigger: &Message, sender: &str, error: &str, stage: &str) -> Message {
    let payload = trigger.payload();
    trigger.follow_up(
        sender,
        COORDINATOR,
        Payload::Error(ErrorReport {
            error: error.to_string(),
            stage: stage.to_string(),
            filename: payload.filename().map(str::to_string),
            query: payload.query().map(str::to_string),
            trace: trigger.trace().clone(),
        }),
    )
}
