//! kasane のビルドパイプライン
//!
//! 依存関係順にコンテナイメージ群をビルド・プッシュします。
//! オーケストレータがイメージグラフを構築・フィルタリングし、
//! ルートのビルドタスクをキューへ投入、ワーカーがタスクを再試行付きで
//! 実行して後続タスク（子のビルド、プッシュ）を動的に積んでいきます。

pub mod context;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod orchestrator;
pub mod summary;
pub mod task;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use context::ContextBuilder;
pub use engine::{BuildOptions, ContainerEngine, DockerEngine, split_image_tag};
pub use error::{BuildError, Result};
pub use orchestrator::Orchestrator;
pub use summary::{FailedImage, Summary};
pub use task::{BuildTask, Followup, PushTask, Task, TaskContext};
pub use worker::{QueueItem, TaskQueue, Worker};
