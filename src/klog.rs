use alloc::collections::VecDeque;
use alloc::string::String;
use lazy_static::lazy_static;
use spin::Mutex;

/// How many finished lines the kernel log retains before dropping the oldest.
const KLOG_CAPACITY: usize = 256;

/// In-memory kernel log ring. The serial/console driver (out of tree) drains
/// this; tests can inspect it directly.
pub struct KernelLog {
    lines: VecDeque<String>,
    partial: String,
}

impl KernelLog {
    const fn new() -> Self {
        KernelLog {
            lines: VecDeque::new(),
            partial: String::new(),
        }
    }

    fn push_str(&mut self, s: &str) {
        for ch in s.chars() {
            if ch == '\n' {
                let line = core::mem::take(&mut self.partial);
                if self.lines.len() == KLOG_CAPACITY {
                    self.lines.pop_front();
                }
                self.lines.push_back(line);
            } else {
                self.partial.push(ch);
            }
        }
    }

    /// Drain every complete line out of the ring.
    pub fn take_lines(&mut self) -> VecDeque<String> {
        core::mem::take(&mut self.lines)
    }
}

impl core::fmt::Write for KernelLog {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

lazy_static! {
    pub static ref KLOG: Mutex<KernelLog> = Mutex::new(KernelLog::new());
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    let _ = KLOG.lock().write_fmt(args);
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::klog::_print(format_args!("[INFO] "));
        $crate::klog::_print(format_args!($($arg)*));
        $crate::klog::_print(format_args!("\n"));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::klog::_print(format_args!("[WARN] "));
        $crate::klog::_print(format_args!($($arg)*));
        $crate::klog::_print(format_args!("\n"));
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::klog::_print(format_args!("[ERROR] "));
        $crate::klog::_print(format_args!($($arg)*));
        $crate::klog::_print(format_args!("\n"));
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_on_newline() {
        let mut log = KernelLog::new();
        log.push_str("hello ");
        log.push_str("world\nsecond\npart");
        let lines = log.take_lines();
        assert!(lines.contains(&alloc::string::String::from("hello world")));
        assert!(lines.contains(&alloc::string::String::from("second")));
        assert_eq!(log.partial, "part");
    }

    #[test]
    fn ring_drops_oldest_at_capacity() {
        let mut log = KernelLog::new();
        for i in 0..KLOG_CAPACITY + 8 {
            log.push_str(&alloc::format!("line {}\n", i));
        }
        let lines = log.take_lines();
        assert_eq!(lines.len(), KLOG_CAPACITY);
        assert_eq!(lines.front().unwrap(), "line 8");
    }

    #[test]
    fn macros_reach_the_ring() {
        // The global ring is shared between tests; scan rather than drain.
        crate::log_info!("frame allocator online: {} KiB", 4096);
        let log = KLOG.lock();
        assert!(log
            .lines
            .iter()
            .any(|l| l.starts_with("[INFO] ") && l.contains("4096 KiB")));
    }
}
