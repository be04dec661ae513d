use std::fmt;

/// A value whose provenance includes bytes from the remote peer.
///
/// Nothing inside the wrapper is reachable except through [`Untrusted::validate`],
/// which consumes the wrapper and only hands the payload to a checking function.
/// A function that wants verified data takes `Untrusted<T>` and returns a plain
/// value on success, so "forgot to verify" fails to compile instead of failing
/// in the field.
pub struct Untrusted<T>(T);

impl<T> Untrusted<T> {
    pub fn new(value: T) -> Self {
        Untrusted(value)
    }

    /// Run a verification function over the payload. The payload escapes the
    /// wrapper only through `check`; whatever `check` refuses stays refused.
    pub fn validate<U, E>(self, check: impl FnOnce(T) -> Result<U, E>) -> Result<U, E> {
        check(self.0)
    }
}

// Keep attacker-controlled bytes out of log output.
impl<T> fmt::Debug for Untrusted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Untrusted(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_passes_the_payload_through_the_check() {
        let wrapped = Untrusted::new("7");
        let value: Result<u32, std::num::ParseIntError> = wrapped.validate(str::parse);
        assert_eq!(value.expect("digit should parse"), 7);
    }

    #[test]
    fn validate_surfaces_the_check_failure() {
        let wrapped = Untrusted::new("not a number");
        let value: Result<u32, std::num::ParseIntError> = wrapped.validate(str::parse);
        assert!(value.is_err(), "junk input should not verify");
    }

    #[test]
    fn debug_does_not_leak_the_payload() {
        let wrapped = Untrusted::new("secret bytes");
        assert_eq!(format!("{:?}", wrapped), "Untrusted(..)");
    }
}
