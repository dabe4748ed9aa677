//! Task queue and result hub
//!
//! The queue is the only way into the scheduler thread. Cancels jump the
//! line; tasks whose slot is busy park in the deferred list until a slot
//! frees up. Results travel back over per-task channels registered in the
//! hub, which also serves as the waiting-task-id set.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::task::{Task, TaskPayload, TaskResult};

struct QueueInner {
    tasks: VecDeque<Task>,
    deferred: Vec<Task>,
    next_id: i32,
    closed: bool,
}

/// FIFO task queue with a deferred side-list
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: VecDeque::new(),
                deferred: Vec::new(),
                next_id: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Reserve a task id without queueing anything (the HTTP layer needs
    /// the id before it registers the result channel)
    pub fn next_id(&self) -> i32 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    /// Queue a task. Cancels go to the front; everything else appends.
    pub fn post(&self, task: Task) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        match task.payload {
            TaskPayload::Cancel { .. } => inner.tasks.push_front(task),
            _ => inner.tasks.push_back(task),
        }
        self.available.notify_one();
    }

    /// Park a task until a slot frees up
    pub fn defer(&self, task: Task) {
        let mut inner = self.inner.lock();
        inner.deferred.push(task);
    }

    /// Move every deferred task back into the queue (a slot was released)
    pub fn kick_deferred(&self) {
        let mut inner = self.inner.lock();
        if inner.deferred.is_empty() {
            return;
        }
        let deferred = std::mem::take(&mut inner.deferred);
        inner.tasks.extend(deferred);
        self.available.notify_one();
    }

    /// Non-blocking pop
    pub fn try_pop(&self) -> Option<Task> {
        self.inner.lock().tasks.pop_front()
    }

    /// Blocking pop; `None` once the queue is closed and drained
    pub fn pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(task) = inner.tasks.pop_front() {
                return Some(task);
            }
            if inner.closed {
                return None;
            }
            self.available.wait(&mut inner);
        }
    }

    /// Close the queue and wake the scheduler for shutdown
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-task result channels; presence in the map is "a response is
/// awaited for this task id"
#[derive(Default)]
pub struct ResultHub {
    channels: DashMap<i32, mpsc::UnboundedSender<TaskResult>>,
}

impl ResultHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register interest in a task's results
    pub fn register(&self, task_id: i32) -> mpsc::UnboundedReceiver<TaskResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(task_id, tx);
        rx
    }

    /// Deliver a result; final frames drop the channel registration
    pub fn send(&self, result: TaskResult) {
        let id = result.id;
        let done = result.stop || result.error;
        if let Some(entry) = self.channels.get(&id) {
            // a closed receiver means the client went away; the scheduler
            // notices via cancellation, not here
            let _ = entry.value().send(result);
        }
        if done {
            self.channels.remove(&id);
        }
    }

    /// Whether anyone still awaits this task
    pub fn is_waiting(&self, task_id: i32) -> bool {
        self.channels.contains_key(&task_id)
    }

    /// Drop interest (client disconnected or request finished early)
    pub fn unregister(&self, task_id: i32) {
        self.channels.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{CompletionMode, CompletionTask, SlotParams};
    use serde_json::json;

    fn completion_task(id: i32) -> Task {
        Task {
            id,
            payload: TaskPayload::Completion(Box::new(CompletionTask {
                prompt: json!("hello"),
                params: SlotParams::default(),
                mode: CompletionMode::Normal,
            })),
        }
    }

    #[test]
    fn test_cancel_jumps_the_line() {
        let queue = TaskQueue::new();
        queue.post(completion_task(0));
        queue.post(completion_task(1));
        queue.post(Task {
            id: 2,
            payload: TaskPayload::Cancel { target: 0 },
        });

        assert!(matches!(
            queue.try_pop().unwrap().payload,
            TaskPayload::Cancel { target: 0 }
        ));
        assert_eq!(queue.try_pop().unwrap().id, 0);
        assert_eq!(queue.try_pop().unwrap().id, 1);
    }

    #[test]
    fn test_deferred_kick() {
        let queue = TaskQueue::new();
        queue.defer(completion_task(5));
        assert!(queue.try_pop().is_none());

        queue.kick_deferred();
        assert_eq!(queue.try_pop().unwrap().id, 5);
    }

    #[test]
    fn test_ids_monotonic() {
        let queue = TaskQueue::new();
        assert_eq!(queue.next_id(), 0);
        assert_eq!(queue.next_id(), 1);
        assert_eq!(queue.next_id(), 2);
    }

    #[tokio::test]
    async fn test_result_hub_roundtrip() {
        let hub = ResultHub::new();
        let mut rx = hub.register(7);
        assert!(hub.is_waiting(7));

        hub.send(TaskResult::partial(7, json!({"content": "a"})));
        hub.send(TaskResult::finished(7, json!({"content": ""})));

        let first = rx.recv().await.unwrap();
        assert!(!first.stop);
        let last = rx.recv().await.unwrap();
        assert!(last.stop);
        assert!(!hub.is_waiting(7));
    }
}
