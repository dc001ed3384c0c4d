//! # Envelopes and Results
//!
//! The unit on the wire ([`Envelope`]), the record delivered back to a caller
//! ([`Outcome`]), and the single-shot channel it travels on ([`Sink`]).

use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::id::MessageId;

/// Application-defined message discriminator.
pub type Kind = u32;

/// One message on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    pub id: MessageId,
    /// `MessageId::NONE` for an original message, otherwise the id being answered.
    pub reply_to: MessageId,
    pub kind: Kind,
    pub message: M,
}

impl<M> Envelope<M> {
    pub fn is_reply(&self) -> bool {
        !self.reply_to.is_none()
    }
}

/// The result of one call, delivered exactly once on its sink.
#[derive(Debug)]
pub struct Outcome<M> {
    /// Id of the original message this outcome answers.
    pub call: MessageId,
    /// Id of the correlated reply; `MessageId::NONE` when no reply arrived.
    pub id: MessageId,
    pub result: Result<M>,
}

impl<M> Outcome<M> {
    pub(crate) fn reply(call: MessageId, id: MessageId, message: M) -> Self {
        Self {
            call,
            id,
            result: Ok(message),
        }
    }

    pub(crate) fn failed(call: MessageId, error: Error) -> Self {
        Self {
            call,
            id: MessageId::NONE,
            result: Err(error),
        }
    }
}

/// Where the outcome of a call is delivered.
///
/// A sink is consumed by delivery, so no sink ever receives two values.
#[derive(Debug)]
pub enum Sink<M> {
    /// A dedicated single-value channel.
    Once(oneshot::Sender<Outcome<M>>),
    /// A shared queue collecting outcomes of many calls. It must have spare
    /// capacity whenever an outcome is due, or the connection terminates.
    Queue(mpsc::Sender<Outcome<M>>),
}

impl<M> Sink<M> {
    pub fn once() -> (Self, oneshot::Receiver<Outcome<M>>) {
        let (tx, rx) = oneshot::channel();
        (Sink::Once(tx), rx)
    }

    pub fn queue(tx: mpsc::Sender<Outcome<M>>) -> Self {
        Sink::Queue(tx)
    }

    /// Hands the outcome over without waiting.
    ///
    /// A receiver that is gone is not an error: the caller stopped listening.
    /// A full queue is.
    pub(crate) fn deliver(self, outcome: Outcome<M>) -> Result<()> {
        match self {
            Sink::Once(tx) => {
                let _ = tx.send(outcome);
                Ok(())
            }
            Sink::Queue(tx) => match tx.try_send(outcome) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => Err(Error::new(ErrorKind::WouldBlock)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Category;

    #[test]
    fn test_once_sink_delivers_to_receiver() {
        let (sink, mut rx) = Sink::once();
        sink.deliver(Outcome::reply(MessageId(1), MessageId(2), "pong")).unwrap();
        let outcome = rx.try_recv().unwrap();
        assert_eq!(outcome.id, MessageId(2));
        assert_eq!(outcome.result.unwrap(), "pong");
    }

    #[test]
    fn test_full_queue_sink_would_block() {
        let (tx, _rx) = mpsc::channel(1);
        Sink::queue(tx.clone()).deliver(Outcome::reply(MessageId(1), MessageId(2), 1)).unwrap();
        let err = Sink::queue(tx).deliver(Outcome::reply(MessageId(3), MessageId(4), 2)).unwrap_err();
        assert_eq!(err.category(), Category::Temporary);
    }

    #[test]
    fn test_dropped_receiver_is_not_an_error() {
        let (sink, rx) = Sink::<u8>::once();
        drop(rx);
        assert!(sink.deliver(Outcome::failed(MessageId(1), Error::new(ErrorKind::Shutdown))).is_ok());
    }
}
