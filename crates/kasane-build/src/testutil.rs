//! テスト用のモックエンジンとグラフ構築ヘルパ

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use kasane_core::{BuildConfig, Image, ImageGraph, ImageSources};

use crate::engine::{BuildOptions, ContainerEngine};
use crate::error::{BuildError, Result};
use crate::task::TaskContext;

#[derive(Debug, Clone, Copy)]
enum PushFailure {
    Connection,
    Protocol,
}

/// 呼び出しを記録するだけのコンテナエンジン
#[derive(Default)]
pub struct MockEngine {
    built: Mutex<Vec<String>>,
    pushed: Mutex<Vec<String>>,
    fail_builds: Mutex<HashSet<String>>,
    push_failure: Mutex<Option<PushFailure>>,
    existing: Mutex<HashSet<String>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定タグのビルドを常に失敗させる
    pub fn fail_build(&self, tag: &str) {
        self.fail_builds.lock().unwrap().insert(tag.to_string());
    }

    pub fn fail_push_connection(&self) {
        *self.push_failure.lock().unwrap() = Some(PushFailure::Connection);
    }

    pub fn fail_push_protocol(&self) {
        *self.push_failure.lock().unwrap() = Some(PushFailure::Protocol);
    }

    /// 存在確認に応答するイメージを登録する
    pub fn add_existing(&self, tag: &str) {
        self.existing.lock().unwrap().insert(tag.to_string());
    }

    /// ビルドされたタグを呼び出し順で返す
    pub fn build_order(&self) -> Vec<String> {
        self.built.lock().unwrap().clone()
    }

    pub fn build_count(&self, tag: &str) -> usize {
        self.built.lock().unwrap().iter().filter(|t| *t == tag).count()
    }

    pub fn total_builds(&self) -> usize {
        self.built.lock().unwrap().len()
    }

    pub fn total_pushes(&self) -> usize {
        self.pushed.lock().unwrap().len()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn build(&self, _context_dir: &Path, tag: &str, _opts: &BuildOptions) -> Result<()> {
        self.built.lock().unwrap().push(tag.to_string());
        if self.fail_builds.lock().unwrap().contains(tag) {
            return Err(BuildError::BuildFailed(format!("mock failure: {}", tag)));
        }
        Ok(())
    }

    async fn push(&self, repo: &str, tag: &str) -> Result<()> {
        match *self.push_failure.lock().unwrap() {
            Some(PushFailure::Connection) => {
                Err(BuildError::Connection("mock connection refused".to_string()))
            }
            Some(PushFailure::Protocol) => {
                Err(BuildError::PushFailed("mock push rejected".to_string()))
            }
            None => {
                self.pushed.lock().unwrap().push(format!("{}:{}", repo, tag));
                Ok(())
            }
        }
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        Ok(self.existing.lock().unwrap().contains(reference))
    }

    async fn last_layer(&self, _reference: &str) -> Result<Option<String>> {
        Ok(Some("sha256:mock-layer".to_string()))
    }

    async fn squash(&self, _reference: &str, _from_layer: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// 名前と親名の組からリンク済みのタスクコンテキストを組み立てる
///
/// 親名はベース名で指定する（canonical name へはここで変換する）。
pub fn chain_context(
    specs: &[(&str, Option<&str>)],
    configure: impl FnOnce(&MockEngine),
) -> (TaskContext, Arc<MockEngine>) {
    let conf = Arc::new(BuildConfig::default());

    let mut graph = ImageGraph::new();
    for (name, parent) in specs {
        let parent_name = parent.map(|p| conf.canonical_name(p));
        graph.insert(Image::new(
            *name,
            conf.canonical_name(name),
            std::env::temp_dir(),
            parent_name,
            ImageSources::default(),
        ));
    }
    graph.link();

    let engine = MockEngine::new();
    configure(&engine);
    let engine = Arc::new(engine);

    let ctx = TaskContext {
        graph: Arc::new(graph),
        conf,
        engine: engine.clone(),
    };
    (ctx, engine)
}
