//! Protocol extensions carried over PassThrough messages, and handoff
//! handlers for server-directed stream switches.

use super::events::{Event, EventQueue};
use crate::protocol::messages::HandoffResult;

/// Reply handle given to an extension; sending re-enters the session
/// through the event queue like every other mutation.
pub struct ExtensionReply {
    protocol_id: String,
    queue: EventQueue,
}

impl ExtensionReply {
    pub(crate) fn new(protocol_id: &str, queue: EventQueue) -> Self {
        ExtensionReply {
            protocol_id: protocol_id.to_string(),
            queue,
        }
    }

    pub fn send(&self, data: &[u8]) {
        self.queue.put(Event::ProtocolExtensionSend {
            protocol_id: self.protocol_id.clone(),
            data: data.to_vec(),
        });
    }
}

/// One registered PassThrough protocol.
pub trait ProtocolExtension: Send {
    fn protocol_id(&self) -> &str;
    fn received(&mut self, data: &[u8], reply: &ExtensionReply);
}

/// Built-in extension answering every message with its own payload.
#[derive(Default)]
pub struct EchoProtocolExtension;

impl ProtocolExtension for EchoProtocolExtension {
    fn protocol_id(&self) -> &str {
        "echo"
    }

    fn received(&mut self, data: &[u8], reply: &ExtensionReply) {
        reply.send(data);
    }
}

/// Handler for one handoff URI scheme.
pub trait HandoffHandler: Send {
    fn handoff_request(&mut self, scheme: &str, arg: &str, resume_session_when_done: bool)
        -> HandoffResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_extension_replies_with_payload() {
        let (queue, receiver) = EventQueue::new();
        let reply = ExtensionReply::new("echo", queue);
        let mut echo = EchoProtocolExtension;
        echo.received(&[1, 2, 3], &reply);

        match receiver.try_recv().unwrap() {
            Event::ProtocolExtensionSend { protocol_id, data } => {
                assert_eq!(protocol_id, "echo");
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
