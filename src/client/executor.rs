use std::time::{Duration, Instant};

use bson::{Document, RawDocument};
use rand::Rng;

use super::Client;
use crate::{
    bson_util,
    cmap::{conn::wire::Message, Command, Connection, RawCommandResponse},
    error::{
        CommandErrorBody,
        Error,
        ErrorKind,
        Result,
        RETRYABLE_WRITE_ERROR,
    },
    options::ServerAddress,
    sdam::HandshakePhase,
    selection_criteria::SelectionCriteria,
};

/// Base delay for the dispatcher's retry backoff.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(5);
const RETRY_BACKOFF_FACTOR: f64 = 1.5;
const RETRY_BACKOFF_JITTER: f64 = 0.5;
const RETRY_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Commands that may be retried as writes when `retryWrites` is enabled and the deployment
/// supports it.
const RETRYABLE_WRITE_COMMANDS: &[&str] = &[
    "insert",
    "update",
    "delete",
    "findandmodify",
    "findAndModify",
];

/// Commands that may be retried as reads when `retryReads` is enabled.
const RETRYABLE_READ_COMMANDS: &[&str] = &[
    "find",
    "aggregate",
    "distinct",
    "count",
    "listCollections",
    "listDatabases",
    "listIndexes",
];

/// How a given command may be retried.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Retryability {
    Write,
    Read,
    None,
}

impl Client {
    /// Execute a command against the database named by `db` and deserialize the reply.
    ///
    /// The command is dispatched according to the given selection criteria (defaulting to the
    /// client-wide criteria, then to `Primary`), retried once on retryable failures, and
    /// reauthenticated and retried if the server demands fresh credentials mid-session.
    pub async fn run_command(
        &self,
        db: impl AsRef<str>,
        command: Document,
        criteria: impl Into<Option<SelectionCriteria>>,
    ) -> Result<Document> {
        let name = command
            .keys()
            .next()
            .map(|key| key.to_string())
            .ok_or_else(|| {
                Error::from(ErrorKind::InvalidArgument {
                    message: "an empty document cannot be run as a command".to_string(),
                })
            })?;

        let command = Command::new_from_document(name, db.as_ref(), command)?;
        let response = self.execute_command(command, criteria.into(), None).await?;
        response.body()
    }

    /// The dispatcher's entry point: selects a server, checks out a connection, sends the
    /// command, interprets errors, and applies the retry policy exactly once per operation.
    pub(crate) async fn execute_command(
        &self,
        command: Command,
        criteria: Option<SelectionCriteria>,
        timeout: Option<Duration>,
    ) -> Result<RawCommandResponse> {
        if self.is_shutdown() {
            return Err(ErrorKind::Shutdown.into());
        }

        let criteria = criteria.or_else(|| self.options().selection_criteria.clone());
        let deadline = timeout.map(|t| Instant::now() + t);
        let retryability = self.command_retryability(&command.name);

        let mut retry: Option<ExecutionRetry> = None;
        loop {
            let server = match self
                .select_server(
                    criteria.as_ref(),
                    deadline,
                    retry.as_ref().map(|r| &r.first_server),
                )
                .await
            {
                Ok(server) => server,
                Err(err) => {
                    return Err(first_error(retry, err));
                }
            };
            let server_addr = server.address.clone();

            let mut conn = match server.pool.check_out(deadline).await {
                Ok(conn) => conn,
                Err(mut err) => {
                    if retry.is_some() {
                        return Err(first_error(retry, err));
                    }

                    if err.is_read_retryable()
                        && self.options().retry_writes != Some(false)
                    {
                        err.add_label(RETRYABLE_WRITE_ERROR);
                    }

                    let can_retry = match retryability {
                        Retryability::Read => err.is_read_retryable(),
                        Retryability::Write => err.is_write_retryable(),
                        Retryability::None => false,
                    };
                    if err.is_pool_cleared() || err.is_system_overloaded() || can_retry {
                        // An overloaded pool needs a moment to let its rate limiter refill
                        // before the reselection can succeed.
                        if err.is_system_overloaded() {
                            backoff(1, deadline).await;
                        }
                        retry = Some(ExecutionRetry {
                            prior_txn_number: None,
                            first_error: err,
                            first_server: server_addr.clone(),
                        });
                        continue;
                    } else {
                        return Err(err);
                    }
                }
            };

            let effective_retryability = self.connection_retryability(retryability, &conn);
            let txn_number = match effective_retryability {
                Retryability::Write => Some(
                    retry
                        .as_ref()
                        .and_then(|r| r.prior_txn_number)
                        .unwrap_or_else(|| self.next_transaction_number()),
                ),
                _ => None,
            };

            let result = self
                .execute_command_on_connection(command.clone(), &mut conn, &criteria, txn_number, deadline)
                .await;

            match result {
                Ok(response) => return Ok(response),
                Err(mut err) => {
                    err.wire_version = conn
                        .stream_description
                        .as_ref()
                        .and_then(|sd| sd.max_wire_version);

                    if effective_retryability == Retryability::Write {
                        if let Some(max_wire_version) = err.wire_version {
                            if err.should_add_retryable_write_label(max_wire_version) {
                                err.add_label(RETRYABLE_WRITE_ERROR);
                            }
                        }
                    }

                    // Feed the failure back into SDAM before deciding on a retry: stepdowns
                    // transition the server to Unknown and clear its pool.
                    self.topology()
                        .handle_application_error(
                            server_addr.clone(),
                            err.clone(),
                            HandshakePhase::after_completion(&conn),
                        )
                        .await;
                    // Release the connection to be processed by the connection pool.
                    drop(conn);
                    // Release the selected server to decrement its operation count.
                    drop(server);

                    if let Some(r) = retry {
                        // The retry budget is one; surface whichever error is more meaningful.
                        if err.is_server_error()
                            || err.is_read_retryable()
                            || err.is_write_retryable()
                        {
                            return Err(err);
                        } else {
                            return Err(r.first_error);
                        }
                    } else if effective_retryability == Retryability::Read
                        && err.is_read_retryable()
                        || effective_retryability == Retryability::Write
                            && err.is_write_retryable()
                    {
                        backoff(1, deadline).await;
                        retry = Some(ExecutionRetry {
                            prior_txn_number: txn_number,
                            first_error: err,
                            first_server: server_addr.clone(),
                        });
                        continue;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Executes the command on a specific connection, running the reauthentication protocol and
    /// retrying on the same connection if the server returns a ReauthenticationRequired error.
    async fn execute_command_on_connection(
        &self,
        mut command: Command,
        conn: &mut Connection,
        criteria: &Option<SelectionCriteria>,
        txn_number: Option<i64>,
        deadline: Option<Instant>,
    ) -> Result<RawCommandResponse> {
        self.topology()
            .watch()
            .peek_latest()
            .description
            .update_command_with_read_pref(conn.address(), &mut command, criteria.as_ref())?;

        if let Some(txn_number) = txn_number {
            command.set_txn_number(txn_number);
        }

        let mut reauth_attempted = false;
        loop {
            let result = self.send_command_on_connection(command.clone(), conn, deadline).await;

            match result {
                Err(err)
                    if err.is_reauthentication_required()
                        && !reauth_attempted
                        && self.options().credential.is_some() =>
                {
                    let credential = self.options().credential.as_ref().unwrap();
                    if let Err(reauth_err) = credential.reauthenticate_stream(conn).await {
                        // The connection's credential state is unknown; make sure it is not
                        // returned to the idle pool.
                        conn.mark_broken(reauth_err.clone());
                        return Err(reauth_err);
                    }
                    reauth_attempted = true;
                    continue;
                }
                other => return other,
            }
        }
    }

    async fn send_command_on_connection(
        &self,
        command: Command,
        conn: &mut Connection,
        deadline: Option<Instant>,
    ) -> Result<RawCommandResponse> {
        let should_compress = command.should_compress();
        let message = Message::from_command(command, None)?;

        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let io_timeout = match (self.options().socket_timeout, remaining) {
            (Some(socket_timeout), Some(remaining)) => Some(socket_timeout.min(remaining)),
            (socket_timeout, remaining) => socket_timeout.or(remaining),
        };

        let response = match io_timeout {
            Some(io_timeout) => {
                match crate::runtime::timeout(io_timeout, conn.send_message(message, should_compress))
                    .await
                {
                    Ok(result) => result?,
                    Err(timeout_error) => {
                        // The deadline expired with a write or read possibly still in flight;
                        // the stream is in an indeterminate state and must not be reused.
                        conn.mark_broken(timeout_error.clone());
                        return Err(timeout_error);
                    }
                }
            }
            None => conn.send_message(message, should_compress).await?,
        };

        let raw_doc = RawDocument::from_bytes(response.as_bytes())?;
        let ok = match raw_doc.get("ok")? {
            Some(b) => bson_util::get_int_raw(b).ok_or_else(|| {
                Error::from(ErrorKind::InvalidResponse {
                    message: format!("expected ok value to be a number, instead got {:?}", b),
                })
            })?,
            None => {
                return Err(ErrorKind::InvalidResponse {
                    message: "missing 'ok' value in response".to_string(),
                }
                .into())
            }
        };

        if ok == 1 {
            Ok(response)
        } else {
            Err(response
                .body::<CommandErrorBody>()
                .map(|error_response| error_response.into())
                .unwrap_or_else(|e| {
                    Error::from(ErrorKind::InvalidResponse {
                        message: format!("error deserializing command error: {}", e),
                    })
                }))
        }
    }

    /// The retryability of the command itself, before accounting for the deployment.
    fn command_retryability(&self, command_name: &str) -> Retryability {
        if RETRYABLE_WRITE_COMMANDS.contains(&command_name)
            && self.options().retry_writes != Some(false)
        {
            return Retryability::Write;
        }
        if RETRYABLE_READ_COMMANDS.contains(&command_name)
            && self.options().retry_reads != Some(false)
        {
            return Retryability::Read;
        }
        Retryability::None
    }

    /// Downgrades write retryability when the server the command is about to run on does not
    /// support retryable writes.
    fn connection_retryability(&self, retryability: Retryability, conn: &Connection) -> Retryability {
        match retryability {
            Retryability::Write => {
                let supported = conn
                    .stream_description
                    .as_ref()
                    .map(|sd| sd.supports_retryable_writes())
                    .unwrap_or(false)
                    && self
                        .topology()
                        .watch()
                        .peek_latest()
                        .description
                        .supports_retryable_writes();
                if supported {
                    Retryability::Write
                } else {
                    Retryability::None
                }
            }
            other => other,
        }
    }
}

#[derive(Debug)]
struct ExecutionRetry {
    prior_txn_number: Option<i64>,
    first_error: Error,
    first_server: ServerAddress,
}

/// When a second failure occurs after a retry, the error from the first attempt is the one
/// surfaced for server selection and checkout failures.
fn first_error(retry: Option<ExecutionRetry>, current: Error) -> Error {
    match retry {
        Some(r) => r.first_error,
        None => current,
    }
}

/// Sleeps out the retry backoff for the given attempt: `base × factor^(attempt-1) × U(1 ± jitter)`,
/// saturating at the configured maximum and never exceeding the remaining deadline.
async fn backoff(attempt: u32, deadline: Option<Instant>) {
    let exponential =
        RETRY_BACKOFF_BASE.as_secs_f64() * RETRY_BACKOFF_FACTOR.powi(attempt.saturating_sub(1) as i32);
    let jitter = rand::thread_rng()
        .gen_range((1.0 - RETRY_BACKOFF_JITTER)..=(1.0 + RETRY_BACKOFF_JITTER));
    let mut delay = Duration::from_secs_f64(exponential * jitter).min(RETRY_BACKOFF_MAX);

    if let Some(deadline) = deadline {
        delay = delay.min(deadline.saturating_duration_since(Instant::now()));
    }

    if !delay.is_zero() {
        crate::runtime::delay_for(delay).await;
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::{backoff, RETRY_BACKOFF_MAX};

    #[tokio::test]
    async fn backoff_is_bounded() {
        let start = Instant::now();
        backoff(1, None).await;
        // base 5ms with max jitter is at most 7.5ms; leave slack for scheduling.
        assert!(start.elapsed() < RETRY_BACKOFF_MAX);

        // A deadline in the past means no sleeping at all.
        let start = Instant::now();
        backoff(10, Some(Instant::now() - Duration::from_secs(1))).await;
        assert!(start.elapsed() < Duration::from_millis(5));
    }
}
