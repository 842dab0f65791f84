//! `constants` binding: errno and open-flag values content compares against.

use serde_json::json;

use crate::builtins::Registration;
use crate::error::RuntimeResult;

/// Errno names and the values content sees for them.
pub const ERRNO: &[(&str, i64)] = &[
    ("ENOENT", 2),
    ("EIO", 5),
    ("EACCES", 13),
    ("EEXIST", 17),
    ("ENOTDIR", 20),
    ("EISDIR", 21),
    ("ENOTEMPTY", 39),
    ("ECANCELED", 125),
];

pub const OPEN_FLAGS: &[(&str, i64)] = &[
    ("O_RDONLY", 0),
    ("O_WRONLY", 1),
    ("O_RDWR", 2),
    ("O_CREAT", 0o100),
    ("O_EXCL", 0o200),
    ("O_TRUNC", 0o1000),
    ("O_APPEND", 0o2000),
];

pub(crate) fn register(reg: &mut Registration<'_>) -> RuntimeResult<()> {
    for &(name, value) in ERRNO.iter().chain(OPEN_FLAGS) {
        reg.value(name, json!(value));
    }
    Ok(())
}

/// Numeric value of an errno name.
pub fn errno(code: &str) -> Option<i64> {
    ERRNO
        .iter()
        .find(|(name, _)| *name == code)
        .map(|&(_, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_lookup() {
        assert_eq!(errno("ENOENT"), Some(2));
        assert_eq!(errno("ECANCELED"), Some(125));
        assert_eq!(errno("EWHATEVER"), None);
    }
}
