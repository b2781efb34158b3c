//! The foreground/worker rendezvous: a blocking handoff implemented with
//! `std::sync::{Mutex, Condvar}`, mirroring the original's
//! `pthread_mutex_t` + `pthread_cond_wait` idle/requested/processing/
//! completed/idle cycle one-to-one.

use std::sync::{Condvar, Mutex};

use crate::device::DeviceConfig;
use crate::error::{Error, Result};
use crate::platform::WakeChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Requested,
    Processing,
    Completed,
}

/// The request a foreground caller has posted.
#[derive(Debug, Clone)]
pub enum Command {
    SetConfig(DeviceConfig),
    Start { dac_enable: bool },
    Stop,
}

struct Shared {
    phase: Phase,
    command: Option<Command>,
    result: Option<Result<()>>,
}

pub struct CommandBridge {
    state: Mutex<Shared>,
    condvar: Condvar,
}

impl CommandBridge {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Shared { phase: Phase::Idle, command: None, result: None }),
            condvar: Condvar::new(),
        }
    }

    /// Foreground side: post `command`, wake the worker, and block until it
    /// reports completion. This always returns the worker's actual result;
    /// callers that want to ignore failure (as `Device::stop` does) do so
    /// themselves.
    pub fn post(&self, wake: &WakeChannel, command: Command) -> Result<()> {
        {
            let mut guard = self.state.lock().unwrap();
            guard.command = Some(command);
            guard.phase = Phase::Requested;
        }
        wake.wake()?;

        let guard = self.state.lock().unwrap();
        let mut guard = self.condvar.wait_while(guard, |s| s.phase != Phase::Completed).unwrap();
        let result = guard.result.take().unwrap_or(Ok(()));
        guard.phase = Phase::Idle;
        result
    }

    /// Worker side: called once per main-loop iteration. Returns the
    /// pending command, transitioning `requested` → `processing`, or
    /// `None` if nothing is pending.
    pub fn try_take(&self) -> Option<Command> {
        let mut guard = self.state.lock().unwrap();
        if guard.phase != Phase::Requested {
            return None;
        }
        guard.phase = Phase::Processing;
        guard.command.take()
    }

    /// Worker side: report the outcome of a command taken via
    /// [`try_take`](Self::try_take) and wake the waiting foreground caller.
    pub fn complete(&self, result: Result<()>) {
        let mut guard = self.state.lock().unwrap();
        guard.result = Some(result);
        guard.phase = Phase::Completed;
        drop(guard);
        self.condvar.notify_all();
    }
}

impl Default for CommandBridge {
    fn default() -> Self {
        Self::new()
    }
}
