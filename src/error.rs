//! # Errors
//!
//! Every operation reports failures through a return value, never by panicking.
//! The variants map 1:1 onto the errno codes a C caller of a pthread-style API would expect,
//! see [Error::errno].

use strum_macros::{Display, EnumIter, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum Error {
    /// malformed deadline or an object that isn't initialized (or was destroyed)
    #[strum(to_string = "invalid argument")]
    InvalidArgument,
    /// the caller doesn't own the mutex
    #[strum(to_string = "operation requires owning the mutex")]
    NotOwner,
    /// trylock contention or destroy while in use
    #[strum(to_string = "resource busy")]
    Busy,
    /// the deadline elapsed before a wakeup
    #[strum(to_string = "timed out")]
    TimedOut,
    /// lock requested by the thread already owning the mutex
    #[strum(to_string = "lock would deadlock")]
    Deadlock,
    /// a fixed-size waiter queue is full
    #[strum(to_string = "resource temporarily unavailable")]
    Again,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::error::Error for Error {}

impl Error {
    pub fn errno(self) -> i32 {
        match self {
            Error::InvalidArgument => libc::EINVAL,
            Error::NotOwner => libc::EPERM,
            Error::Busy => libc::EBUSY,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::Deadlock => libc::EDEADLK,
            Error::Again => libc::EAGAIN,
        }
    }

    pub fn from_errno(errno: i32) -> Option<Self> {
        match errno {
            libc::EINVAL => Some(Error::InvalidArgument),
            libc::EPERM => Some(Error::NotOwner),
            libc::EBUSY => Some(Error::Busy),
            libc::ETIMEDOUT => Some(Error::TimedOut),
            libc::EDEADLK => Some(Error::Deadlock),
            libc::EAGAIN => Some(Error::Again),
            _ => None,
        }
    }
}
