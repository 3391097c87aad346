//! Pipelines: batches of commands written contiguously and resolved
//! together, optionally wrapped in a MULTI/EXEC transaction.

use std::time::Duration;

use crate::cmd::{cmd, Cmd};
use crate::conn::Connection;
use crate::errors::{ErrorKind, RedioxResult};
use crate::types::Value;

/// The outcome of a transactional pipeline.
#[derive(Debug)]
pub enum ExecOutcome {
    /// The transaction executed; per-command results in submission order.
    Completed(Vec<RedioxResult<Value>>),
    /// The server aborted the transaction before execution, e.g. because a
    /// watched key changed. No command ran.
    Aborted,
}

/// An ordered batch of commands.
///
/// The batch is transmitted as one contiguous write and its replies are
/// returned together, element-wise: one command failing does not abort the
/// others. Switch on [`atomic`](Pipeline::atomic) to wrap the batch in a
/// transaction that executes indivisibly or not at all.
///
/// A pipeline is never split across a reconnection: when the transport drops
/// before all replies are in, the whole batch is resubmitted or failed as a
/// unit, per the connection's resend policy.
#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    cmds: Vec<Cmd>,
    atomic: bool,
    timeout: Option<Duration>,
}

/// Shortcut for [`Pipeline::new`].
pub fn pipe() -> Pipeline {
    Pipeline::new()
}

impl Pipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Pipeline {
        Pipeline::default()
    }

    /// Appends a command to the batch.
    pub fn add(mut self, command: Cmd) -> Pipeline {
        self.cmds.push(command);
        self
    }

    /// Makes the pipeline transactional.
    pub fn atomic(mut self) -> Pipeline {
        self.atomic = true;
        self
    }

    /// Deadline for the whole batch.
    pub fn timeout(mut self, deadline: Duration) -> Pipeline {
        self.timeout = Some(deadline);
        self
    }

    /// Number of commands collected so far.
    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    /// True when no commands were collected.
    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub(crate) fn commands(&self) -> &[Cmd] {
        &self.cmds
    }

    pub(crate) fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub(crate) fn timeout_value(&self) -> Option<Duration> {
        self.timeout
    }

    /// Executes a non-transactional batch on the given connection.
    pub async fn query(&self, conn: &Connection) -> RedioxResult<Vec<RedioxResult<Value>>> {
        debug_assert!(!self.atomic, "use query_atomic for transactional pipelines");
        conn.send_batch(self.cmds.clone(), self.timeout).await
    }

    /// Executes the batch as a MULTI/EXEC transaction on the given
    /// connection.
    pub async fn query_atomic(&self, conn: &Connection) -> RedioxResult<ExecOutcome> {
        if self.cmds.is_empty() {
            return Ok(ExecOutcome::Completed(vec![]));
        }
        let mut wrapped = Vec::with_capacity(self.cmds.len() + 2);
        wrapped.push(cmd("MULTI"));
        wrapped.extend(self.cmds.iter().cloned());
        wrapped.push(cmd("EXEC"));
        let raw = conn.send_batch(wrapped, self.timeout).await?;
        interpret_exec(raw, self.cmds.len())
    }
}

/// Maps the raw reply sequence of a MULTI/EXEC batch onto the caller-facing
/// outcome. `raw` holds the replies to MULTI, the queued commands, and EXEC,
/// in that order.
pub(crate) fn interpret_exec(
    raw: Vec<RedioxResult<Value>>,
    command_count: usize,
) -> RedioxResult<ExecOutcome> {
    let mut iter = raw.into_iter();
    // MULTI itself failing fails the whole transaction
    match iter.next() {
        Some(Ok(_)) => {}
        Some(Err(err)) => return Err(err),
        None => {
            return Err(crate::errors::Error::from((
                ErrorKind::ProtocolError,
                "Transaction reply sequence was empty",
            )))
        }
    }
    // skip the QUEUED acknowledgements; queue-stage rejections surface
    // through the EXEC reply below
    let exec_reply = iter.nth(command_count).ok_or_else(|| {
        crate::errors::Error::from((
            ErrorKind::ProtocolError,
            "Transaction reply sequence was truncated",
        ))
    })?;
    match exec_reply {
        Ok(Value::Nil) => Ok(ExecOutcome::Aborted),
        Ok(Value::Array(items)) => Ok(ExecOutcome::Completed(
            items.into_iter().map(Value::extract_error).collect(),
        )),
        Ok(other) => Err(crate::errors::Error::from((
            ErrorKind::ProtocolError,
            "Unexpected EXEC reply",
            format!("{other:?}"),
        ))),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerError;

    fn queued() -> RedioxResult<Value> {
        Ok(Value::SimpleString("QUEUED".into()))
    }

    #[test]
    fn exec_array_completes_elementwise() {
        let raw = vec![
            Ok(Value::Okay),
            queued(),
            queued(),
            Ok(Value::Array(vec![
                Value::Okay,
                Value::ServerError(ServerError {
                    code: "ERR".into(),
                    detail: "bad".into(),
                }),
            ])),
        ];
        match interpret_exec(raw, 2).unwrap() {
            ExecOutcome::Completed(results) => {
                assert!(results[0].is_ok());
                assert!(results[1].is_err());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn exec_nil_means_aborted() {
        let raw = vec![Ok(Value::Okay), queued(), Ok(Value::Nil)];
        assert!(matches!(
            interpret_exec(raw, 1).unwrap(),
            ExecOutcome::Aborted
        ));
    }

    #[test]
    fn exec_error_propagates() {
        let raw = vec![
            Ok(Value::Okay),
            Err(crate::errors::make_server_error("ERR", "unknown command")),
            Err(crate::errors::make_server_error("EXECABORT", "previous errors")),
        ];
        let err = interpret_exec(raw, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecAbort);
    }

    #[test]
    fn truncated_sequences_are_protocol_errors() {
        let raw = vec![Ok(Value::Okay), queued()];
        assert_eq!(
            interpret_exec(raw, 1).unwrap_err().kind(),
            ErrorKind::ProtocolError
        );
    }
}
