// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Real-time thread priority toggle, scoped down from a platform shim that
// also handled audio-period calibration — this scheduler only ever needs
// to flip the calling thread between its normal priority and a realtime
// class before/after the block-thread main loop's blocking waits.

/// Raise the calling thread to a realtime scheduling class. Called once at
/// thread start for threads configured `realtime: true`
/// ([`crate::config::ThreadConfig`]).
pub fn enter_realtime_priority() -> std::io::Result<()> {
    imp::enter_realtime_priority()
}

/// Restore the calling thread to the platform's normal scheduling class.
/// Called around a blocking wait so a realtime thread does not starve the
/// rest of the system while asleep, then again to re-enter realtime
/// priority on wakeup.
pub fn enter_normal_priority() -> std::io::Result<()> {
    imp::enter_normal_priority()
}

#[cfg(target_os = "linux")]
mod imp {
    /// Priority used for `SCHED_FIFO`. Fixed rather than configurable: the
    /// original system used a single realtime tier for block threads, with
    /// no per-thread priority spread.
    const SCHED_FIFO_PRIORITY: i32 = 50;

    pub fn enter_realtime_priority() -> std::io::Result<()> {
        let param = libc::sched_param {
            sched_priority: SCHED_FIFO_PRIORITY,
        };
        let ret = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
        if ret == 0 {
            Ok(())
        } else {
            Err(std::io::Error::from_raw_os_error(ret))
        }
    }

    pub fn enter_normal_priority() -> std::io::Result<()> {
        let param = libc::sched_param { sched_priority: 0 };
        let ret = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_OTHER, &param) };
        if ret == 0 {
            Ok(())
        } else {
            Err(std::io::Error::from_raw_os_error(ret))
        }
    }
}

#[cfg(windows)]
mod imp {
    use windows_sys::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_NORMAL, THREAD_PRIORITY_TIME_CRITICAL,
    };

    pub fn enter_realtime_priority() -> std::io::Result<()> {
        let ok = unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL) };
        if ok != 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    pub fn enter_normal_priority() -> std::io::Result<()> {
        let ok = unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_NORMAL) };
        if ok != 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
mod imp {
    pub fn enter_realtime_priority() -> std::io::Result<()> {
        Ok(())
    }

    pub fn enter_normal_priority() -> std::io::Result<()> {
        Ok(())
    }
}
