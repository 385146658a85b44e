//! IPC bookkeeping
//!
//! Message passing itself lives in the IPC layer. The task core only keeps
//! what that layer needs to survive task teardown:
//! - per-task sender lists (tasks blocked sending to this one), so every
//!   waiting sender gets an ABORTED notification when the receiver dies
//! - the `timeout` and `wait_for` fields, stored but never interpreted

use super::Kernel;
use super::error::{TaskError, TaskResult};
use super::task::{TaskId, TaskState, WaitFor};
use super::trace::TraceCategory;
use crate::platform::Hal;

impl<H: Hal> Kernel<H> {
    /// Record that blocked task `sender` waits to send to `receiver`.
    ///
    /// Fails with [`TaskError::InvalidArgument`] if either task is not
    /// alive, either is being destroyed, the sender is not blocked or is
    /// already waiting somewhere, or both are the same task.
    pub fn add_sender(&self, receiver: TaskId, sender: TaskId) -> TaskResult<()> {
        let mut guard = self.table.lock();
        let table = &mut *guard;

        let receiver_ok = table.get(receiver).is_some_and(|task| !task.destroyed);
        let sender_ok = table
            .get(sender)
            .is_some_and(|task| !task.destroyed && task.state == TaskState::Blocked);
        let (Some(r), Some(s)) = (receiver.index(), sender.index()) else {
            return Err(TaskError::InvalidArgument);
        };
        if !receiver_ok || !sender_ok || r == s || table.wait_links[s].owner().is_some() {
            return Err(TaskError::InvalidArgument);
        }

        table.tasks[r].senders.push_back(&mut table.wait_links, s);
        table
            .tracer
            .record(TraceCategory::Ipc, "send-wait", sender, None);
        Ok(())
    }

    /// Stop `sender` waiting on `receiver`. Returns whether it was waiting.
    pub fn remove_sender(&self, receiver: TaskId, sender: TaskId) -> bool {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        if table.get(receiver).is_none() || table.get(sender).is_none() {
            return false;
        }
        let (Some(r), Some(s)) = (receiver.index(), sender.index()) else {
            return false;
        };
        table.tasks[r].senders.remove(&mut table.wait_links, s)
    }

    /// Take the longest-waiting sender of `receiver`
    pub fn pop_sender(&self, receiver: TaskId) -> Option<TaskId> {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        table.get(receiver)?;
        let r = receiver.index()?;
        table.tasks[r]
            .senders
            .pop_front(&mut table.wait_links)
            .map(TaskId::from_index)
    }

    /// Tasks waiting to send to `receiver`, oldest first
    pub fn senders(&self, receiver: TaskId) -> Vec<TaskId> {
        self.find(receiver)
            .map(|task| task.senders)
            .unwrap_or_default()
    }

    pub fn set_timeout(&self, tid: TaskId, ticks: u32) -> TaskResult<()> {
        let mut table = self.table.lock();
        let task = table.get_mut(tid).ok_or(TaskError::InvalidArgument)?;
        task.timeout = ticks;
        Ok(())
    }

    pub fn set_wait_for(&self, tid: TaskId, wait_for: WaitFor) -> TaskResult<()> {
        let mut table = self.table.lock();
        let task = table.get_mut(tid).ok_or(TaskError::InvalidArgument)?;
        task.wait_for = wait_for;
        Ok(())
    }
}
