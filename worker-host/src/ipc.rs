//! Named command channels between the UI transport and an [`crate::router::EventRouter`].

use shared_types::{InboundMessage, ListResponse};
use tokio::sync::{mpsc, oneshot, Mutex};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum IpcError {
    #[error("IPC channel '{0}' is closed")]
    Closed(&'static str),
    #[error("IPC channel '{0}' dropped the request without replying")]
    NoReply(&'static str),
}

/// One inbound command, with a slot for the router's direct reply.
#[derive(Debug)]
pub struct IpcRequest {
    pub message: InboundMessage,
    pub reply: Option<oneshot::Sender<Option<ListResponse>>>,
}

/// Receiving side, drained by whichever router has been started on it.
#[derive(Debug)]
pub struct IpcChannel {
    name: &'static str,
    pub(crate) inbox: Mutex<mpsc::UnboundedReceiver<IpcRequest>>,
}

impl IpcChannel {
    pub fn new(name: &'static str) -> (Self, IpcSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name,
                inbox: Mutex::new(rx),
            },
            IpcSender { name, tx },
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Debug, Clone)]
pub struct IpcSender {
    name: &'static str,
    tx: mpsc::UnboundedSender<IpcRequest>,
}

impl IpcSender {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fire-and-forget.
    pub fn send(&self, message: InboundMessage) -> Result<(), IpcError> {
        self.tx
            .send(IpcRequest {
                message,
                reply: None,
            })
            .map_err(|_| IpcError::Closed(self.name))
    }

    /// Send and wait for the router to handle the command. Resolves to
    /// `Some` only for `list`.
    pub async fn invoke(&self, message: InboundMessage) -> Result<Option<ListResponse>, IpcError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(IpcRequest {
                message,
                reply: Some(reply_tx),
            })
            .map_err(|_| IpcError::Closed(self.name))?;
        reply_rx.await.map_err(|_| IpcError::NoReply(self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::Command;

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let (channel, sender) = IpcChannel::new("test");
        assert_eq!(channel.name(), "test");

        let responder = tokio::spawn(async move {
            let mut inbox = channel.inbox.lock().await;
            let request = inbox.recv().await.unwrap();
            assert_eq!(request.message.command, Command::List);
            request
                .reply
                .unwrap()
                .send(Some(ListResponse {
                    ids: vec!["a".to_string()],
                }))
                .unwrap();
        });

        let reply = sender
            .invoke(InboundMessage::new("", Command::List))
            .await
            .unwrap();
        assert_eq!(reply.unwrap().ids, vec!["a"]);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_after_channel_dropped() {
        let (channel, sender) = IpcChannel::new("gone");
        drop(channel);
        assert_eq!(
            sender.send(InboundMessage::new("a", Command::Remove)),
            Err(IpcError::Closed("gone"))
        );
    }
}
