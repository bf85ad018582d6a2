//! Call tickets: one pending request travelling from a caller to a worker.

use std::time::{Instant, SystemTime};

use tokio::sync::oneshot;
use uuid::Uuid;

use wasm_calc_common::GuestError;

use crate::context::CallContext;

/// What the worker should ask the guest to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketKind {
    /// Evaluate an expression.
    Parse(String),
    /// Read the guest clock.
    Clock,
}

impl TicketKind {
    /// Short label for traces.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::Clock => "clock",
        }
    }
}

/// A successful guest answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketOutput {
    /// Decimal result of a parse.
    Parsed(String),
    /// Guest clock reading.
    Timestamp(SystemTime),
}

/// Receiving half held by the submitter.
pub type ReplyReceiver = oneshot::Receiver<Result<TicketOutput, GuestError>>;

/// One pending request.
///
/// Dropping a ticket without resolving it closes the reply channel, which
/// the submitter reads as "not executed".
#[derive(Debug)]
pub struct CallTicket {
    /// Identifier used in traces.
    pub id: Uuid,

    /// The requested guest operation.
    pub kind: TicketKind,

    /// The submitter's context, checked again before dispatch.
    pub ctx: CallContext,

    /// When the ticket entered the queue.
    pub enqueued_at: Instant,

    reply: oneshot::Sender<Result<TicketOutput, GuestError>>,
}

impl CallTicket {
    /// Create a ticket and the receiver its result will arrive on.
    pub fn new(kind: TicketKind, ctx: CallContext) -> (Self, ReplyReceiver) {
        let (reply, receiver) = oneshot::channel();
        let ticket = Self {
            id: Uuid::new_v4(),
            kind,
            ctx,
            enqueued_at: Instant::now(),
            reply,
        };
        (ticket, receiver)
    }

    /// Returns `true` if the submitter has stopped waiting.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    /// Deliver the result. Returns `false` if nobody was waiting for it.
    pub fn resolve(self, result: Result<TicketOutput, GuestError>) -> bool {
        self.reply.send(result).is_ok()
    }
}
