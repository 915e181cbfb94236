//! # Host scheduler
//!
//! The locks need four things from the host: who am I, what's my priority, what's someone else's
//! priority and "run that thread at this priority". [Scheduler] is that seam, so tests can swap
//! the real OS for a fake and check the boosting protocol without root privileges.
//!
//! Priorities are plain integers, larger is more urgent. [OsScheduler] maps them onto
//! Linux real-time priorities: 1..=99 are SCHED_FIFO (or SCHED_RR if the thread already uses it),
//! 0 is the regular SCHED_OTHER class.

pub trait Scheduler {
    /// Kernel thread id of the caller. It's global across processes.
    fn current_tid(&self) -> u32;
    fn current_priority(&self) -> i32;
    fn priority_of(&self, tid: u32) -> i32;
    /// Best effort: failures mustn't break the lock protocol.
    fn set_priority(&self, tid: u32, priority: i32);
}

/// Never cached: a forked child gets a new tid while thread-locals are copied.
pub fn gettid() -> u32 {
    // SAFETY: gettid has no arguments and can't fail
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

const SCHED_RESET_ON_FORK: i32 = 0x4000_0000;

#[derive(Debug, Default, Clone, Copy)]
pub struct OsScheduler;

impl OsScheduler {
    fn policy_of(tid: u32) -> i32 {
        // SAFETY: plain syscall wrapper, an unknown tid just yields -1
        let policy = unsafe { libc::sched_getscheduler(tid as libc::pid_t) };
        if policy < 0 {
            policy
        } else {
            policy & !SCHED_RESET_ON_FORK
        }
    }
}

impl Scheduler for OsScheduler {
    fn current_tid(&self) -> u32 {
        gettid()
    }

    fn current_priority(&self) -> i32 {
        self.priority_of(gettid())
    }

    fn priority_of(&self, tid: u32) -> i32 {
        match Self::policy_of(tid) {
            libc::SCHED_FIFO | libc::SCHED_RR => {
                // SAFETY: sched_param is plain data
                let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
                // SAFETY: param is a valid out-pointer
                if unsafe { libc::sched_getparam(tid as libc::pid_t, &mut param) } == 0 {
                    param.sched_priority
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn set_priority(&self, tid: u32, priority: i32) {
        let priority = priority.clamp(0, 99);
        let policy = match Self::policy_of(tid) {
            libc::SCHED_RR if priority > 0 => libc::SCHED_RR,
            _ if priority > 0 => libc::SCHED_FIFO,
            _ => libc::SCHED_OTHER,
        };
        // SAFETY: sched_param is plain data
        let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
        param.sched_priority = priority;
        // SAFETY: param is valid for the duration of the call
        if unsafe { libc::sched_setscheduler(tid as libc::pid_t, policy, &param) } != 0 {
            log::debug!(
                "can't move thread {tid} to priority {priority}: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}
