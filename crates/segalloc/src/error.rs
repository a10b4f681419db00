//! Error plumbing shared by the allocator.

use core::{error::Error, fmt};

use snafu::GenerateImplicitData;

/// Source location recorded when an error value is constructed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Location {
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// An error that knows where it was constructed.
pub trait Located: Error {
    fn location(&self) -> Location;

    /// The located view of [`Error::source`], if the source has one.
    ///
    /// Must return the same error as `source()` does.
    fn located_source(&self) -> Option<&dyn Located> {
        None
    }
}

/// Renders an error together with its chain of sources and the location
/// each of them was raised at.
///
/// ```text
/// Error: heap initialization failed: out of memory
///   at crates/segalloc/src/heap/mod.rs:175:18
///
/// Caused by:
///    0: heap region exhausted: requested 4096 bytes, 84 bytes available
///       at crates/segalloc/src/region.rs:120:9
/// ```
pub struct Report<E> {
    error: E,
}

impl<E> Report<E> {
    #[must_use]
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E> fmt::Debug for Report<E>
where
    E: Located,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Located,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.error)?;
        writeln!(f, "  at {}", self.error.location())?;
        let mut source = self.error.source();
        let mut located = self.error.located_source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {s}")?;
            if let Some(l) = located {
                writeln!(f, "      at {}", l.location())?;
                located = l.located_source();
            }
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

/// Stops the process with a rendered report of `err`.
#[track_caller]
pub fn halt<E>(err: E) -> !
where
    E: Located,
{
    let report = Report::new(err);
    panic!("heap corruption detected\n\n{report}");
}
