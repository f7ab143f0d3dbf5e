//! Platform HAL (§6): the boundary to hardware. Consumed, not implemented —
//! a real device backs this with RTC registers and a kernel suspend syscall.
//! `NullHal` is the in-crate stand-in used for tests and hardware-less runs.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use tracing::info;

/// Why a resume happened, mirrored on the `resume{resumetype}` broadcast
/// (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResumeType {
    Kernel = 0,
    Activity = 1,
    NonIdle = 2,
    Abort = 3,
}

/// Platform collaborators the Suspend Core drives but does not implement.
pub trait PlatformHal: Send + Sync {
    /// Reads the RTC hardware register, seconds.
    fn read_rtc(&self) -> Option<i64>;

    /// Programs the next RTC wakeup. `expiry` of `None` clears the alarm
    /// (programmed to zero, §4.D). `with_callback` is true only when the
    /// device is awake; during suspend the RTC is armed with no callback.
    fn arm_rtc(&self, expiry: Option<i64>, with_callback: bool) -> bool;

    /// Invokes the kernel-level suspend primitive. Blocks until the device
    /// wakes (by RTC interrupt or other wake source).
    fn suspend(&self) -> bool;

    /// True when the display is powered on; the idle watcher is a no-op
    /// while this holds.
    fn display_on(&self) -> bool;

    /// True when a charger is currently connected.
    fn charger_present(&self) -> bool;
}

/// Logs every call and simulates RTC state via an in-memory register, so
/// the crate is runnable and testable without real hardware.
pub struct NullHal {
    rtc_register: AtomicI64,
    display_on: AtomicBool,
    charger_present: AtomicBool,
    suspend_should_succeed: AtomicBool,
    arm_rtc_should_succeed: AtomicBool,
    suspend_calls: AtomicUsize,
}

impl Default for NullHal {
    fn default() -> Self {
        Self {
            rtc_register: AtomicI64::new(0),
            display_on: AtomicBool::new(false),
            charger_present: AtomicBool::new(false),
            suspend_should_succeed: AtomicBool::new(true),
            arm_rtc_should_succeed: AtomicBool::new(true),
            suspend_calls: AtomicUsize::new(0),
        }
    }
}

impl NullHal {
    pub fn set_display_on(&self, on: bool) {
        self.display_on.store(on, Ordering::SeqCst);
    }

    pub fn set_charger_present(&self, present: bool) {
        self.charger_present.store(present, Ordering::SeqCst);
    }

    pub fn set_rtc(&self, value: i64) {
        self.rtc_register.store(value, Ordering::SeqCst);
    }

    pub fn set_suspend_should_succeed(&self, succeed: bool) {
        self.suspend_should_succeed.store(succeed, Ordering::SeqCst);
    }

    pub fn set_arm_rtc_should_succeed(&self, succeed: bool) {
        self.arm_rtc_should_succeed.store(succeed, Ordering::SeqCst);
    }

    pub fn suspend_calls(&self) -> usize {
        self.suspend_calls.load(Ordering::SeqCst)
    }
}

impl PlatformHal for NullHal {
    fn read_rtc(&self) -> Option<i64> {
        Some(self.rtc_register.load(Ordering::SeqCst))
    }

    fn arm_rtc(&self, expiry: Option<i64>, with_callback: bool) -> bool {
        info!(target: "hal", ?expiry, with_callback, "arm_rtc");
        self.arm_rtc_should_succeed.load(Ordering::SeqCst)
    }

    fn suspend(&self) -> bool {
        info!(target: "hal", "suspend()");
        self.suspend_calls.fetch_add(1, Ordering::SeqCst);
        self.suspend_should_succeed.load(Ordering::SeqCst)
    }

    fn display_on(&self) -> bool {
        self.display_on.load(Ordering::SeqCst)
    }

    fn charger_present(&self) -> bool {
        self.charger_present.load(Ordering::SeqCst)
    }
}
