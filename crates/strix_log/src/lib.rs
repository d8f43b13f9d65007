#![cfg_attr(not(test), no_std)]

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use strix_sync::Spin;

/// A sink for kernel console output.
pub trait ConsoleWrite: Send + Sync {
    fn write(&self, s: &str);
}

struct Console {
    console: Option<&'static dyn ConsoleWrite>,
}

static CONSOLE: Spin<Console> = Spin::new(Console::new());

/// Runtime switch for the allocation trace. When enabled, every allocator
/// entry point logs the operation together with the caller's file and line.
static ALLOC_TRACE: AtomicBool = AtomicBool::new(false);

impl Console {
    const fn new() -> Self {
        Self { console: None }
    }
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(console) = self.console.as_ref() {
            console.write(s);
        }
        Ok(())
    }
}

pub fn set_console(console: &'static dyn ConsoleWrite) {
    CONSOLE.lock_irq().console.replace(console);
}

pub fn set_alloc_trace(enabled: bool) {
    ALLOC_TRACE.store(enabled, Ordering::Relaxed);
}

pub fn alloc_trace_enabled() -> bool {
    ALLOC_TRACE.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn do_print(args: fmt::Arguments) {
    let _ = CONSOLE.lock_irq().write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::do_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! pr_info {
    ($($arg:tt)*) => {
        $crate::println!("[mem: info] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! pr_warn {
    ($($arg:tt)*) => {
        $crate::println!("[mem: warn] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! pr_err {
    ($($arg:tt)*) => {
        $crate::println!("[mem:error] {}", format_args!($($arg)*))
    };
}

/// Allocation-trace line. Formats nothing unless the trace is enabled.
#[macro_export]
macro_rules! pr_trace {
    ($($arg:tt)*) => {
        if $crate::alloc_trace_enabled() {
            $crate::println!("[mem:trace] {}", format_args!($($arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Capture {
        lines: Mutex<String>,
    }

    impl ConsoleWrite for Capture {
        fn write(&self, s: &str) {
            self.lines.lock().unwrap().push_str(s);
        }
    }

    #[test]
    fn print_goes_to_registered_console() {
        let capture: &'static Capture = Box::leak(Box::new(Capture {
            lines: Mutex::new(String::new()),
        }));
        set_console(capture);

        pr_info!("hello {}", 42);

        let lines = capture.lines.lock().unwrap();
        assert!(lines.contains("[mem: info] hello 42"));
    }

    #[test]
    fn trace_toggle() {
        assert!(!alloc_trace_enabled());
        set_alloc_trace(true);
        assert!(alloc_trace_enabled());
        set_alloc_trace(false);
        assert!(!alloc_trace_enabled());
    }
}
