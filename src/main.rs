use std::env::args;
use std::str::FromStr;
use std::string::ToString;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering::SeqCst};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use log::{LevelFilter, Log, Metadata, Record};
use pi_sync::{cancel, shared, CondFlags, MutexFlags, PiCond, PiMutex, SharedMapping, Timespec};
use strum::IntoEnumIterator;
use strum_macros::{self, Display, EnumIter, EnumString};

fn main() -> Result<(), String> {
    log::set_logger(&STDERR_LOGGER)
        .map(|()| log::set_max_level(level_from_env()))
        .map_err(|e| e.to_string())?;
    args()
        .nth(1)
        .ok_or(format!(
            "no scenario supplied, use one of {} or see unit tests",
            Scenario::iter()
                .map(|s| s.to_string())
                .collect::<Vec<String>>()
                .join(",")
        ))
        .and_then(|selector| Scenario::from_str(&selector).map_err(|e| e.to_string()))
        .and_then(|scenario| match scenario {
            Scenario::Signal => signal(),
            Scenario::Broadcast => broadcast(),
            Scenario::Cancel => cancellation(),
            Scenario::Timeout => timeout(),
            Scenario::Shared => process_shared(),
        })
}

#[derive(EnumIter, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
enum Scenario {
    Signal,
    Broadcast,
    Cancel,
    Timeout,
    Shared,
}

static LOCK: PiMutex = PiMutex::new();
static READY: PiCond = PiCond::new(&LOCK);

/// One waiter, one signaller, a predicate guarded by the mutex.
fn signal() -> Result<(), String> {
    static FLAG: AtomicBool = AtomicBool::new(false);
    let waiter = thread::spawn(|| -> pi_sync::Result<()> {
        let _guard = LOCK.lock_guard()?;
        while !FLAG.load(SeqCst) {
            READY.wait()?;
        }
        println!("waiter: flag is set");
        Ok(())
    });
    thread::sleep(Duration::from_millis(50));
    {
        let _guard = LOCK.lock_guard().map_err(|e| e.to_string())?;
        FLAG.store(true, SeqCst);
        READY.signal().map_err(|e| e.to_string())?;
        println!("main: signalled");
    }
    join(waiter)
}

/// Ten waiters released by one broadcast.
fn broadcast() -> Result<(), String> {
    static GO: AtomicBool = AtomicBool::new(false);
    let barrier = Arc::new(Barrier::new(11));
    let waiters: Vec<_> = (0..10)
        .map(|i| {
            let barrier = barrier.clone();
            thread::spawn(move || -> pi_sync::Result<()> {
                let guard = LOCK.lock_guard()?;
                barrier.wait();
                while !GO.load(SeqCst) {
                    READY.wait()?;
                }
                drop(guard);
                println!("waiter {i} released");
                Ok(())
            })
        })
        .collect();
    barrier.wait();
    while READY.waiters() < 10 {
        thread::sleep(Duration::from_millis(1));
    }
    {
        let _guard = LOCK.lock_guard().map_err(|e| e.to_string())?;
        GO.store(true, SeqCst);
        READY.broadcast().map_err(|e| e.to_string())?;
    }
    waiters.into_iter().try_for_each(join)
}

/// A waiter cancelled while blocked leaves the mutex behind unlocked.
fn cancellation() -> Result<(), String> {
    let (tx, rx) = std::sync::mpsc::channel();
    let waiter = thread::spawn(move || -> pi_sync::Result<()> {
        let _ = tx.send(cancel::handle());
        let _guard = LOCK.lock_guard()?;
        loop {
            READY.wait()?;
        }
    });
    let handle = rx.recv().map_err(|e| e.to_string())?;
    while READY.waiters() == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    handle.cancel();
    match waiter.join() {
        Err(payload) if cancel::is_cancelled(payload.as_ref()) => {
            println!("waiter cancelled, mutex locked: {}", LOCK.is_locked());
            Ok(())
        }
        Err(_) => Err("waiter panicked".to_string()),
        Ok(r) => r.map_err(|e| e.to_string()),
    }
}

/// A timed wait nobody signals.
fn timeout() -> Result<(), String> {
    let _guard = LOCK.lock_guard().map_err(|e| e.to_string())?;
    let deadline = Timespec::after(Duration::from_millis(100));
    match READY.timed_wait(&deadline) {
        Err(pi_sync::Error::TimedOut) => {
            println!("timed out, still owner: {}", LOCK.is_locked());
            Ok(())
        }
        other => Err(format!("unexpected wait outcome {other:?}")),
    }
}

/// Parent and forked child rendezvous on primitives in a shared mapping.
fn process_shared() -> Result<(), String> {
    let map = SharedMapping::new(4096).map_err(|e| e.to_string())?;
    let cond_at = shared::end_of::<PiMutex>(0);
    let flag_at = shared::end_of::<PiCond>(cond_at);
    let m: &PiMutex = map.place(0).map_err(|e| e.to_string())?;
    let c: &PiCond = map
        .place(shared::align_up(cond_at, std::mem::align_of::<PiCond>()))
        .map_err(|e| e.to_string())?;
    let flag: &AtomicU32 = map
        .place(shared::align_up(flag_at, std::mem::align_of::<AtomicU32>()))
        .map_err(|e| e.to_string())?;
    m.init(MutexFlags::PSHARED).map_err(|e| e.to_string())?;
    // SAFETY: both live in the same mapping for its whole lifetime
    unsafe { c.init(m, CondFlags::PSHARED) }.map_err(|e| e.to_string())?;

    // SAFETY: the child only touches the mapping and exits without unwinding
    match unsafe { libc::fork() } {
        -1 => Err(std::io::Error::last_os_error().to_string()),
        0 => {
            let deadline = Timespec::after(Duration::from_secs(10));
            let outcome = m.lock().and_then(|()| {
                while flag.load(SeqCst) == 0 {
                    c.timed_wait(&deadline)?;
                }
                m.unlock()
            });
            // SAFETY: plain process exit
            unsafe { libc::_exit(i32::from(outcome.is_err())) }
        }
        child => {
            while c.waiters() == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            m.lock().map_err(|e| e.to_string())?;
            flag.store(1, SeqCst);
            c.signal().map_err(|e| e.to_string())?;
            m.unlock().map_err(|e| e.to_string())?;
            let mut status = 0;
            // SAFETY: child is our own pid
            unsafe { libc::waitpid(child, &mut status, 0) };
            println!("child {child} exited with {}", libc::WEXITSTATUS(status));
            if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
                Ok(())
            } else {
                Err(format!("child failed with status {status}"))
            }
        }
    }
}

fn join(handle: thread::JoinHandle<pi_sync::Result<()>>) -> Result<(), String> {
    handle
        .join()
        .map_err(|_| "thread panicked".to_string())?
        .map_err(|e| e.to_string())
}

fn level_from_env() -> LevelFilter {
    std::env::var("PI_SYNC_LOG")
        .ok()
        .and_then(|l| LevelFilter::from_str(&l).ok())
        .unwrap_or(LevelFilter::Info)
}

struct StderrLogger;

static STDERR_LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}
