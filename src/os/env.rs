//! Process environment.
//!
//! Writes change the whole process's environment. Other threads reading it
//! through the C library at the same time is the caller's problem.

use crate::error::{Errno, Status};
use tracing::trace;

fn check_name(name: &str) -> Status {
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return Err(Errno::InvalidArgument);
    }
    Ok(())
}

/// Value of `name`; `NotFound` when unset
pub fn getenv(name: &str) -> Result<String, Errno> {
    check_name(name)?;
    let value = std::env::var_os(name).ok_or(Errno::NotFound)?;
    value.into_string().map_err(|_| Errno::InvalidArgument)
}

/// Set `name` to `value`
pub fn setenv(name: &str, value: &str) -> Status {
    check_name(name)?;
    if value.contains('\0') {
        return Err(Errno::InvalidArgument);
    }
    trace!(name, "Setting environment variable");
    std::env::set_var(name, value);
    Ok(())
}

/// Remove `name`; removing an unset name succeeds
pub fn unsetenv(name: &str) -> Status {
    check_name(name)?;
    std::env::remove_var(name);
    Ok(())
}

/// Every variable, lossily decoded
pub fn environ() -> Vec<(String, String)> {
    std::env::vars_os()
        .map(|(name, value)| {
            (
                name.to_string_lossy().into_owned(),
                value.to_string_lossy().into_owned(),
            )
        })
        .collect()
}
