//! タスクキューとワーカー
//!
//! 無制限のFIFOキューを複数のワーカーで排出します。キューは
//! 未完了カウンタを持ち、`put` で増え `task_done` で減ります。
//! メインループはこのカウンタが両キューで0になるのを待ってから
//! トゥームストーンを投入し、ワーカーを停止させます。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::task::{BuildTask, Followup, PushTask, Task, TaskContext};

/// キューの要素
pub enum QueueItem {
    Task(Box<Task>),
    /// ワーカー停止の番兵。受け取ったワーカーは仲間のために再投入して抜ける
    Tombstone,
}

/// スレッドセーフな無制限FIFOキュー
///
/// 取り出した要素1件につき `task_done` をちょうど1回呼ぶこと。
pub struct TaskQueue {
    items: Mutex<VecDeque<QueueItem>>,
    ready: Semaphore,
    unfinished: AtomicUsize,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Semaphore::new(0),
            unfinished: AtomicUsize::new(0),
        }
    }

    pub fn put(&self, item: QueueItem) {
        self.items
            .lock()
            .expect("task queue lock poisoned")
            .push_back(item);
        self.unfinished.fetch_add(1, Ordering::SeqCst);
        self.ready.add_permits(1);
    }

    pub async fn get(&self) -> QueueItem {
        let permit = self
            .ready
            .acquire()
            .await
            .expect("task queue semaphore closed");
        permit.forget();
        self.items
            .lock()
            .expect("task queue lock poisoned")
            .pop_front()
            .expect("queue permit issued without item")
    }

    /// 取り出した要素の処理完了を報告する
    pub fn task_done(&self) {
        self.unfinished.fetch_sub(1, Ordering::SeqCst);
    }

    /// 未完了（キュー内 + 処理中）の要素数
    pub fn unfinished(&self) -> usize {
        self.unfinished.load(Ordering::SeqCst)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// キューを1本担当するワーカー
pub struct Worker {
    name: String,
    queue: Arc<TaskQueue>,
    build_queue: Arc<TaskQueue>,
    push_queue: Arc<TaskQueue>,
    ctx: TaskContext,
    retries: usize,
    stop: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<TaskQueue>,
        build_queue: Arc<TaskQueue>,
        push_queue: Arc<TaskQueue>,
        ctx: TaskContext,
        retries: usize,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            build_queue,
            push_queue,
            ctx,
            retries,
            stop,
        }
    }

    pub async fn run(self) {
        loop {
            let mut task = match self.queue.get().await {
                QueueItem::Tombstone => {
                    // 仲間のワーカーも停止できるよう番兵を戻す
                    self.queue.put(QueueItem::Tombstone);
                    self.queue.task_done();
                    break;
                }
                QueueItem::Task(task) => task,
            };

            let mut success = false;
            for attempt in 0..=self.retries {
                if self.stop.load(Ordering::SeqCst) {
                    info!(
                        worker = %self.name,
                        task = %task.label(),
                        "停止要求を受けたため残りの試行を中止します"
                    );
                    break;
                }
                if attempt > 0 {
                    task.reset();
                    warn!(
                        worker = %self.name,
                        task = %task.label(),
                        attempt,
                        "Retrying task"
                    );
                }
                success = task.run().await;
                if success {
                    break;
                }
            }

            if success && !self.stop.load(Ordering::SeqCst) {
                for followup in task.followups() {
                    match followup {
                        Followup::Build(index) => self.build_queue.put(QueueItem::Task(Box::new(
                            Task::Build(BuildTask::new(self.ctx.clone(), index)),
                        ))),
                        Followup::Push(index) => self.push_queue.put(QueueItem::Task(Box::new(
                            Task::Push(PushTask::new(self.ctx.clone(), index)),
                        ))),
                    }
                }
            }

            self.queue.task_done();
        }
    }
}
