//! Best-effort rollback after a partially completed operation.

use crate::error::{Error, Result};
use tracing::{error, warn};

/// Runs cleanup steps after `primary` failed, keeping `primary` as the result.
///
/// Cleanup failures never replace the original error. Each one is logged as
/// it happens and the failed steps are summarized when the error is returned.
#[derive(Debug)]
pub struct Compensation<'a> {
    volume: &'a str,
    primary: Error,
    failed: Vec<&'static str>,
}

impl<'a> Compensation<'a> {
    /// Start compensating for `primary` on `volume`.
    pub fn new(volume: &'a str, primary: Error) -> Self {
        Self {
            volume,
            primary,
            failed: Vec::new(),
        }
    }

    /// Run one cleanup step. Failure is recorded and the next step still runs.
    pub fn attempt<F>(mut self, step: &'static str, f: F) -> Self
    where
        F: FnOnce() -> Result<()>,
    {
        if let Err(e) = f() {
            warn!(name = %self.volume, step, error = %e, "cleanup step failed");
            self.failed.push(step);
        }
        self
    }

    /// The original error.
    pub fn into_error(self) -> Error {
        if !self.failed.is_empty() {
            error!(
                name = %self.volume,
                failed_steps = ?self.failed,
                error = %self.primary,
                "cleanup incomplete; volume may need manual repair"
            );
        }
        self.primary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_error_survives_cleanup_failures() {
        let mut ran = Vec::new();
        let comp = Compensation::new("vol1", Error::remote("attach failed"))
            .attempt("detach", || {
                ran.push("detach");
                Err(Error::remote("not attached"))
            })
            .attempt("remove", || {
                ran.push("remove");
                Ok(())
            });

        assert_eq!(comp.failed, vec!["detach"]);
        assert_eq!(comp.into_error().to_string(), "attach failed");
        assert_eq!(ran, vec!["detach", "remove"]);
    }

    #[test]
    fn test_no_steps_returns_primary() {
        let err = Compensation::new("vol1", Error::mount("wrong fs type")).into_error();
        assert!(matches!(err, Error::Mount(_)));
    }
}
