use crate::vault::result_error::error::Error;
use crate::vault::result_error::{WithDebugObjectAndFnName, WithFnName, WithMsg};
use std::fmt::Debug;
use std::sync::{LockResult, PoisonError};

pub type Result<T> = std::result::Result<T, Error>;

impl<S: Into<String>, O: Debug + Send + 'static, R> WithDebugObjectAndFnName<S, O> for Result<R> {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        self.map_err(|e| e.with_debug_object_and_fn_name(obj, fn_name))
    }
}

impl<R, S: Into<String>> WithMsg<S> for Result<R> {
    fn with_msg(self, msg: S) -> Self {
        self.map_err(|e| e.with_msg(msg))
    }
}

impl<R, S: Into<String>> WithFnName<S> for Result<R> {
    fn with_fn_name(self, fn_name: S) -> Self {
        self.map_err(|e| e.with_fn_name(fn_name))
    }
}

pub fn convert_error_vec(errors: Vec<Error>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.into())
    }
}

/// Maps a poisoned lock into [`Error::Poisoned`] instead of panicking.
pub fn unpoison<G>(res: LockResult<G>, what: &str) -> Result<G> {
    res.map_err(|e: PoisonError<G>| Error::Poisoned(format!("{what}: {e}")))
}
