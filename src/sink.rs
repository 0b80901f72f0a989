//! Where diagnostic text goes.
//!
//! Both allocators write every diagnostic (errors, reports, leak summaries)
//! through a [`Sink`]. By default the text is written to standard error. A
//! callback can redirect it, for example into a host's own log window.

use std::{
    fmt,
    io::Write,
    sync::{Arc, PoisonError, RwLock},
};

/// A callback receiving diagnostic text. Each call gets one or more complete
/// lines, newline included.
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A redirectable output slot.
#[derive(Default)]
pub struct Sink {
    callback: RwLock<Option<ErrorCallback>>,
}
impl Sink {
    /// A sink writing to standard error.
    pub const fn new() -> Self {
        Self {
            callback: RwLock::new(None),
        }
    }

    /// Redirects all further output to `callback`, or back to standard error
    /// if it is `None`.
    pub fn set_callback(&self, callback: Option<ErrorCallback>) {
        *self
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = callback;
    }

    /// Writes formatted text.
    ///
    /// The callback is called without any lock held, so it may itself
    /// allocate or replace the callback.
    pub fn emit(&self, args: fmt::Arguments<'_>) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => callback(&fmt::format(args)),
            None => {
                let _ = std::io::stderr().lock().write_fmt(args);
            }
        }
    }
}
impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redirected = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("Sink")
            .field("redirected", &redirected)
            .finish()
    }
}
