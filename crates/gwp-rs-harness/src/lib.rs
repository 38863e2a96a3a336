//! Test support for the guarded pool.
//!
//! Scenario tests provoke real faults and recover from them, which makes the
//! process-wide SIGSEGV handler shared state; [`ScenarioPool`] therefore
//! couples every pool to a serial-execution guard. Reports are captured into
//! a process-global buffer through [`capture_printer`].

use std::fmt::{self, Write as _};

use parking_lot::{Mutex, MutexGuard};

use gwp_rs_core::options::Options;
use gwp_rs_handler::install_signal_handler;
use gwp_rs_pool::GuardedPoolAllocator;

pub mod evidence;

static SCENARIO_GUARD: Mutex<()> = Mutex::new(());
static OUTPUT: Mutex<String> = Mutex::new(String::new());

/// Report sink that appends to the shared capture buffer.
pub fn capture_printer(args: fmt::Arguments<'_>) {
    let _ = OUTPUT.lock().write_fmt(args);
}

/// Copy of everything captured since the last clear.
#[must_use]
pub fn captured_output() -> String {
    OUTPUT.lock().clone()
}

pub fn clear_captured_output() {
    OUTPUT.lock().clear();
}

/// Synthetic backtrace capturer with recognizable frames.
pub fn test_backtrace(frames: &mut [usize]) -> usize {
    const FAKE: [usize; 4] = [0x1000_1000, 0x1000_1040, 0x1000_1080, 0x1000_10c0];
    let count = FAKE.len().min(frames.len());
    frames[..count].copy_from_slice(&FAKE[..count]);
    count
}

/// A leaked recoverable pool wired to the capture printer.
///
/// Holds the process-global serial guard for its lifetime so scenario tests
/// never overlap; the capture buffer is cleared on construction.
pub struct ScenarioPool {
    pool: &'static GuardedPoolAllocator,
    _serial: MutexGuard<'static, ()>,
}

impl ScenarioPool {
    #[must_use]
    pub fn new_recoverable(sample_rate: u32, max_simultaneous_allocations: usize) -> Self {
        let serial = SCENARIO_GUARD.lock();
        let pool: &'static GuardedPoolAllocator = Box::leak(Box::new(GuardedPoolAllocator::new()));
        pool.init(Options {
            sample_rate,
            max_simultaneous_allocations,
            recoverable: true,
            backtrace: Some(test_backtrace),
            install_fork_handlers: false,
            ..Options::default()
        })
        .expect("scenario options are valid");
        install_signal_handler(pool, capture_printer, true);
        clear_captured_output();
        Self {
            pool,
            _serial: serial,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &'static GuardedPoolAllocator {
        self.pool
    }
}
