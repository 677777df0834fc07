use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::DataConfig;
use crate::context::DataContext;
use crate::error::{DataError, DataResult};
use crate::transaction::{SideEffect, Transaction};

/// How a transactional closure finished.
#[derive(Debug)]
pub enum TxOutcome<T> {
    /// The closure's transaction committed.
    Committed {
        value: T,
        effects: Vec<SideEffect>,
        attempts: u32,
    },
    /// Every attempt hit a conflict or timeout.
    RetryableConflict { error: DataError, attempts: u32 },
    /// A non-retryable error ended the run.
    Fatal(DataError),
}

impl<T> TxOutcome<T> {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    /// Attempts made; a fatal error is not counted.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Committed { attempts, .. } | Self::RetryableConflict { attempts, .. } => Some(*attempts),
            Self::Fatal(_) => None,
        }
    }

    /// Drop the effects and flatten into a `Result`.
    pub fn into_result(self) -> DataResult<T> {
        match self {
            Self::Committed { value, .. } => Ok(value),
            Self::RetryableConflict { error, .. } | Self::Fatal(error) => Err(error),
        }
    }
}

/// Run `body` in a fresh transaction, retrying the whole transaction on
/// conflicts and timeouts up to the configured number of attempts.
///
/// `body` may run more than once, so it must not have effects outside the
/// transaction; queue those with [`Transaction::defer`].
pub fn run_transaction<T, F>(ctx: &DataContext, mut body: F) -> TxOutcome<T>
where
    F: FnMut(&mut Transaction<'_>) -> DataResult<T>,
{
    let config = ctx.config();
    let max_attempts = config.max_attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        let error = match attempt(ctx, &mut body) {
            Ok((value, effects)) => {
                return TxOutcome::Committed {
                    value,
                    effects,
                    attempts,
                }
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            warn!(app = ctx.app(), attempts, %error, "transaction failed");
            return TxOutcome::Fatal(error);
        }
        if attempts >= max_attempts {
            warn!(app = ctx.app(), attempts, %error, "transaction gave up after retries");
            return TxOutcome::RetryableConflict { error, attempts };
        }
        debug!(app = ctx.app(), attempts, %error, "retrying transaction");
        backoff(config, attempts);
    }
}

fn attempt<T, F>(ctx: &DataContext, body: &mut F) -> DataResult<(T, Vec<SideEffect>)>
where
    F: FnMut(&mut Transaction<'_>) -> DataResult<T>,
{
    let mut tx = ctx.begin()?;
    let value = match body(&mut tx) {
        Ok(value) => value,
        Err(e) => {
            tx.rollback();
            return Err(e);
        }
    };
    if let Some(reason) = tx.rollback_reason() {
        tx.rollback();
        return Err(DataError::RollbackOnly(reason));
    }
    let effects = tx.commit()?;
    Ok((value, effects))
}

fn backoff(config: &DataConfig, attempts: u32) {
    let ceiling = config.retry_backoff_ms.saturating_mul(u64::from(attempts));
    if ceiling > 0 {
        let pause = rand::thread_rng().gen_range(0..=ceiling);
        thread::sleep(Duration::from_millis(pause));
    }
}
