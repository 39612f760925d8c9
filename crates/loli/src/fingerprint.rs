use std::{fmt, num::ParseIntError, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::helper::lock_unwinder;

/// Return addresses of the call stack that made an allocation, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(Vec<usize>);

impl Fingerprint {
    pub fn new(frames: Vec<usize>) -> Self {
        Self(frames)
    }

    /// Capture the current call stack, dropping the `skip` innermost frames and keeping at most
    /// `max_frames`. Repeated adjacent addresses (recursion through one call site) are collapsed.
    ///
    /// Uses [`backtrace::trace_unsynchronized`]: the synchronized api relies on thread-local keys,
    /// which may not be touched from inside an allocator hook.
    pub fn capture(skip: usize, max_frames: usize) -> Self {
        let mut frames = Vec::with_capacity(max_frames);

        if max_frames == 0 {
            return Self(frames);
        }

        let mut skips = 0;

        let _unwinding = lock_unwinder();

        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if skips < skip {
                    skips += 1;
                    return true;
                }

                let ip = frame.ip() as usize;

                if ip != 0 && frames.last() != Some(&ip) {
                    frames.push(ip);
                }

                frames.len() < max_frames
            });
        }

        Self(frames)
    }

    pub fn frames(&self) -> &[usize] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, frame) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(";")?;
            }

            write!(f, "{:#x}", frame)?;
        }

        Ok(())
    }
}

impl FromStr for Fingerprint {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::default());
        }

        s.split(';')
            .map(parse_hex)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

/// Parse `0x`-prefixed (or bare) hexadecimal.
pub(crate) fn parse_hex(value: &str) -> Result<usize, ParseIntError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);

    usize::from_str_radix(digits, 16)
}
