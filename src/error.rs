use std::{error::Error, fmt};

use backtrace::Backtrace;
use log::error;

#[derive(Debug)]
pub struct SmallError {
    details: String,
}

impl SmallError {
    pub fn new(msg: &str) -> SmallError {
        SmallError {
            details: msg.to_string(),
        }
    }

    pub fn get_details(&self) -> &str {
        &self.details
    }

    /// Log the error message together with the backtrace of the current
    /// thread, so the failure site can be located without a debugger.
    pub fn show_backtrace(&self) {
        let backtrace = Backtrace::new();
        error!("{}\nbacktrace:\n{:?}", self.details, backtrace);
    }
}

impl fmt::Display for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.details)
    }
}

impl Error for SmallError {}
