use crate::bundle::Bundle;
use crate::{ExecError, SetupStage};
use kiln_runtime::{RunStatus, Runc, RuntimeError, StepIo};
use kiln_schema::Context;
use tracing::debug;

/// Runs a prepared bundle through the runtime and turns the outcome into the
/// step's result.
#[derive(Debug, Clone)]
pub struct Supervisor {
    runc: Runc,
}

impl Supervisor {
    pub fn new(runc: Runc) -> Self {
        Self { runc }
    }

    pub fn runtime(&self) -> &Runc {
        &self.runc
    }

    pub fn run(&self, ctx: &Context, bundle: &Bundle, io: StepIo) -> Result<(), ExecError> {
        debug!("> running {}", bundle.id());
        let result = self.runc.run(ctx, bundle.id(), bundle.path(), io);
        debug!("< completed {}: {result:?}", bundle.id());
        classify(ctx, result)
    }
}

/// The runtime cannot report cancellation itself, so a non-zero status while
/// the context is done counts as cancelled. A zero status wins over a context
/// that ended after the process exited.
pub fn classify(ctx: &Context, result: Result<RunStatus, RuntimeError>) -> Result<(), ExecError> {
    let status = match result {
        Ok(status) => status,
        Err(RuntimeError::Cancelled(cause)) => {
            return Err(ExecError::Cancelled {
                cause,
                exit_code: None,
            })
        }
        Err(e) => return Err(ExecError::setup(SetupStage::RuntimeStart)(e)),
    };

    if status.code != 0 {
        return Err(match ctx.err() {
            Some(cause) => ExecError::Cancelled {
                cause,
                exit_code: Some(status.code),
            },
            None => ExecError::StepFailed {
                exit_code: status.code,
            },
        });
    }

    match status.io_error {
        Some(e) => Err(ExecError::Io(e)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecErrorKind;
    use kiln_schema::CancelCause;

    fn status(code: i32) -> Result<RunStatus, RuntimeError> {
        Ok(RunStatus {
            code,
            io_error: None,
            killed: false,
        })
    }

    #[test]
    fn zero_status_succeeds() {
        assert!(classify(&Context::background(), status(0)).is_ok());
    }

    #[test]
    fn zero_status_after_cancel_still_succeeds() {
        let ctx = Context::background();
        ctx.cancel();
        assert!(classify(&ctx, status(0)).is_ok());
    }

    #[test]
    fn nonzero_status_is_step_failure() {
        let err = classify(&Context::background(), status(1)).unwrap_err();
        assert_eq!(err.kind(), ExecErrorKind::StepFailed);
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn nonzero_status_with_done_context_is_cancellation() {
        let ctx = Context::background();
        ctx.cancel();
        let err = classify(&ctx, status(137)).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.exit_code(), Some(137));
        assert!(matches!(
            err,
            ExecError::Cancelled {
                cause: CancelCause::Canceled,
                ..
            }
        ));
    }

    #[test]
    fn io_error_surfaces_on_success_only() {
        let broken = || {
            Ok(RunStatus {
                code: 0,
                io_error: Some(std::io::Error::other("pipe")),
                killed: false,
            })
        };
        let err = classify(&Context::background(), broken()).unwrap_err();
        assert_eq!(err.kind(), ExecErrorKind::Io);

        let failed = Ok(RunStatus {
            code: 2,
            io_error: Some(std::io::Error::other("pipe")),
            killed: false,
        });
        assert_eq!(
            classify(&Context::background(), failed).unwrap_err().kind(),
            ExecErrorKind::StepFailed
        );
    }

    #[test]
    fn runtime_errors_are_start_failures() {
        let err = classify(
            &Context::background(),
            Err(RuntimeError::RuntimeUnavailable {
                binary: "runc".to_owned(),
                reason: "gone".to_owned(),
            }),
        )
        .unwrap_err();
        assert_eq!(err.stage(), Some(SetupStage::RuntimeStart));

        let err = classify(
            &Context::background(),
            Err(RuntimeError::Cancelled(CancelCause::DeadlineExceeded)),
        )
        .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.exit_code(), None);
    }
}
