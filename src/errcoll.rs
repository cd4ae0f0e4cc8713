//! Reporting of errors that don't stop processing.
//!
//! Failures of background work such as rule list refreshes and billing
//! uploads are never returned to a query. They are handed to an
//! [`ErrorCollector`] instead.

use parking_lot::Mutex;
use tracing::error;

//------------ ErrorCollector ------------------------------------------------

/// Receives errors from background tasks.
pub trait ErrorCollector: Send + Sync {
    /// Reports an error.
    fn collect(&self, err: &(dyn std::error::Error + 'static));
}

//------------ LogCollector --------------------------------------------------

/// An error collector that logs every error.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogCollector;

impl ErrorCollector for LogCollector {
    fn collect(&self, err: &(dyn std::error::Error + 'static)) {
        error!("{}", chain(err));
    }
}

//------------ MemoryCollector -----------------------------------------------

/// An error collector that keeps the messages of all errors.
#[derive(Debug, Default)]
pub struct MemoryCollector {
    errors: Mutex<Vec<String>>,
}

impl MemoryCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the messages collected so far.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    /// Returns the number of errors collected so far.
    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    /// Returns true if no error was collected.
    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }
}

impl ErrorCollector for MemoryCollector {
    fn collect(&self, err: &(dyn std::error::Error + 'static)) {
        self.errors.lock().push(chain(err));
    }
}

/// Formats an error with all its sources.
fn chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut res = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        res.push_str(": ");
        res.push_str(&err.to_string());
        source = err.source();
    }
    res
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt;

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("refreshing list")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn collects_chain() {
        let coll = MemoryCollector::new();
        assert!(coll.is_empty());
        coll.collect(&Outer(std::io::Error::other("disk full")));
        assert_eq!(coll.errors(), ["refreshing list: disk full"]);
        LogCollector.collect(&Outer(std::io::Error::other("disk full")));
    }
}
