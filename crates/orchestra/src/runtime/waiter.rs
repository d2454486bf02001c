//! Completion barrier that joins the errors of concurrently spawned work

use std::fmt;
use std::future::Future;
use tokio::task::JoinSet;

/// Counted-completion barrier over spawned tasks.
///
/// Each task resolves to `Result<(), E>`; failures are recorded in the order
/// they are observed and returned together by [`Waiter::wait`]. Dropping the
/// waiter detaches its tasks: they keep running, unobserved.
pub struct Waiter<E: 'static> {
    tasks: JoinSet<Result<(), E>>,
    errors: Vec<E>,
}

impl<E: Send + 'static> Waiter<E> {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            errors: Vec::new(),
        }
    }

    /// Spawn a unit of work on the tokio runtime
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Record an error produced outside of a spawned task
    pub fn add_error(&mut self, error: E) {
        self.errors.push(error);
    }

    /// Number of spawned tasks not yet joined
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every spawned task and return all recorded errors at once
    pub async fn wait(mut self) -> Result<(), AggregateError<E>> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => self.errors.push(error),
                Err(join_error) => {
                    if join_error.is_panic() {
                        std::panic::resume_unwind(join_error.into_panic());
                    }
                    log::warn!("Waiter task was cancelled: {}", join_error);
                }
            }
        }

        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError {
                errors: std::mem::take(&mut self.errors),
            })
        }
    }
}

impl<E: 'static> Drop for Waiter<E> {
    fn drop(&mut self) {
        self.tasks.detach_all();
    }
}

impl<E: Send + 'static> Default for Waiter<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Several independent failures joined into one error
#[derive(Debug)]
pub struct AggregateError<E> {
    errors: Vec<E>,
}

impl<E> AggregateError<E> {
    /// The joined errors, in recorded order
    pub fn errors(&self) -> &[E] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<E> {
        self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl<E: fmt::Display> fmt::Display for AggregateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} error(s) waiting for services: [", self.errors.len())?;
        for error in &self.errors {
            writeln!(f, "  {}", error)?;
        }
        write!(f, "]")
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AggregateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors
            .first()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}
