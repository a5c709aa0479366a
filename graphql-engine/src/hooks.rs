//! Instrumentation hooks invoked around every fetch.
//!
//! Hooks are an observability side channel: a failing hook is logged and
//! otherwise ignored, it never fails the fetch it instruments.

use tower::BoxError;

/// Describes where in the response a fetch is happening.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HookContext {
    pub current_path: String,
}

/// Observer notified before and after every fetch.
///
/// `single_flight` is `true` when the result was served from a deduplicated
/// in-flight fetch owned by another caller.
#[cfg_attr(test, mockall::automock)]
pub trait FetchHooks: Send + Sync + 'static {
    fn on_before_fetch(&self, ctx: &HookContext, input: &[u8]) -> Result<(), BoxError> {
        let _ = (ctx, input);
        Ok(())
    }

    fn on_data(&self, ctx: &HookContext, data: &[u8], single_flight: bool) -> Result<(), BoxError> {
        let _ = (ctx, data, single_flight);
        Ok(())
    }

    fn on_error(
        &self,
        ctx: &HookContext,
        errors: &[u8],
        single_flight: bool,
    ) -> Result<(), BoxError> {
        let _ = (ctx, errors, single_flight);
        Ok(())
    }
}

pub(crate) fn report_failure(hook: &'static str, result: Result<(), BoxError>) {
    if let Err(error) = result {
        tracing::warn!(hook, %error, "fetch hook failed");
    }
}
