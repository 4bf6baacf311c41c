//! ビルド・プッシュタスク
//!
//! 1タスクが1イメージを駆動します。失敗はタスク境界で必ず捕捉し、
//! イメージの状態と成功フラグに変換します。ワーカーの再試行判定は
//! 成功フラグだけを見るため、タスクから例外が漏れることはありません。

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use kasane_core::{BuildConfig, ImageGraph, ImageStatus, SourceSpec};

use crate::engine::{BuildOptions, ContainerEngine, split_image_tag};
use crate::fetcher;

/// タスク生成に必要な共有ハンドル
#[derive(Clone)]
pub struct TaskContext {
    pub graph: Arc<ImageGraph>,
    pub conf: Arc<BuildConfig>,
    pub engine: Arc<dyn ContainerEngine>,
}

/// 成功したタスクが生む後続作業
///
/// ワーカーはこのタグで投入先キューを決める。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    /// 子イメージのビルド（ビルドキューへ）
    Build(usize),
    /// このイメージのプッシュ（プッシュキューへ）
    Push(usize),
}

/// ワーカーが扱うタスク
pub enum Task {
    Build(BuildTask),
    Push(PushTask),
}

impl Task {
    pub async fn run(&mut self) -> bool {
        match self {
            Task::Build(task) => task.run().await,
            Task::Push(task) => task.run().await,
        }
    }

    /// 再試行前に一時状態を捨てる
    pub fn reset(&mut self) {
        match self {
            Task::Build(task) => task.reset(),
            Task::Push(task) => task.reset(),
        }
    }

    pub fn followups(&self) -> Vec<Followup> {
        match self {
            Task::Build(task) => task.followups(),
            Task::Push(_) => Vec::new(),
        }
    }

    /// ログ用のラベル
    pub fn label(&self) -> String {
        match self {
            Task::Build(task) => format!("build/{}", task.image().name),
            Task::Push(task) => format!("push/{}", task.image().name),
        }
    }
}

/// 1イメージをビルドするタスク
pub struct BuildTask {
    ctx: TaskContext,
    index: usize,
    success: bool,
}

impl BuildTask {
    pub fn new(ctx: TaskContext, index: usize) -> Self {
        Self {
            ctx,
            index,
            success: false,
        }
    }

    fn image(&self) -> &kasane_core::Image {
        self.ctx.graph.get(self.index)
    }

    pub async fn run(&mut self) -> bool {
        self.build_image().await;
        let status = self.image().status();
        // 除外状態のno-opも失敗ではない
        self.success = status == ImageStatus::Built || status.is_excluded();
        self.success
    }

    pub fn reset(&mut self) {
        self.success = false;
    }

    pub fn followups(&self) -> Vec<Followup> {
        let image = self.image();
        if !self.success || image.status() != ImageStatus::Built {
            return Vec::new();
        }

        let mut followups = Vec::new();
        if self.ctx.conf.push {
            followups.push(Followup::Push(self.index));
        }
        for &child in &image.children {
            if !self.ctx.graph.get(child).status().is_excluded() {
                followups.push(Followup::Build(child));
            }
        }
        followups
    }

    async fn build_image(&self) {
        let image = self.image();

        if image.status().is_excluded() {
            return;
        }

        // 先祖が失敗していたら自分のせいではないが、ビルドもできない
        if let Some(parent) = image.parent {
            let parent_image = self.ctx.graph.get(parent);
            if parent_image.status().is_error() {
                error!(
                    image = %image.name,
                    parent = %parent_image.name,
                    "親イメージのビルドに失敗しているため中止します"
                );
                image.set_status(ImageStatus::ParentError);
                return;
            }
        }

        image.set_status(ImageStatus::Building);
        let started = Instant::now();
        info!(image = %image.name, tag = %image.canonical_name(), "Building image");

        if let Some(spec) = &image.sources.source {
            if fetcher::fetch(image, spec).await.is_none() {
                return;
            }
        }

        // install-type が source のときだけプラグイン類を展開する
        if self.ctx.conf.install_type == "source" {
            if !self.fetch_auxiliary(&image.sources.plugins, "plugins").await {
                return;
            }
            if !self
                .fetch_auxiliary(&image.sources.additions, "additions")
                .await
            {
                return;
            }
        }

        let opts = BuildOptions {
            nocache: self.ctx.conf.no_cache,
            // 非ルートはビルドしたての親を使う。古いベースをpullしてはいけない
            pull: image.parent.is_none() && self.ctx.conf.pull,
            network_mode: self.ctx.conf.network_mode.clone(),
            build_args: self.ctx.conf.effective_build_args(),
            log_path: self
                .ctx
                .conf
                .logs_dir
                .as_ref()
                .map(|dir| dir.join(format!("{}.log", image.name))),
        };

        if let Err(e) = self
            .ctx
            .engine
            .build(&image.path, &image.canonical_name(), &opts)
            .await
        {
            error!(image = %image.name, "ビルドに失敗しました: {}", e);
            image.set_status(ImageStatus::Error);
            return;
        }

        if self.ctx.conf.squash {
            if !self.squash_image().await {
                return;
            }
        }

        image.set_status(ImageStatus::Built);
        info!(
            image = %image.name,
            elapsed_secs = started.elapsed().as_secs(),
            "Image built"
        );
    }

    /// プラグイン・追加アーカイブを取得してコンテキストへ展開する
    async fn fetch_auxiliary(&self, specs: &[SourceSpec], subdir: &str) -> bool {
        let image = self.image();
        for spec in specs {
            let Some(archive) = fetcher::fetch(image, spec).await else {
                return false;
            };
            let dest = image.path.join(subdir).join(&spec.name);
            if let Err(e) = extract_archive(&archive, &dest) {
                error!(
                    image = %image.name,
                    archive = %archive.display(),
                    "アーカイブの展開に失敗しました: {}",
                    e
                );
                image.set_status(ImageStatus::Error);
                return false;
            }
        }
        true
    }

    async fn squash_image(&self) -> bool {
        let image = self.image();
        let canonical = image.canonical_name();

        let from_layer = match image.parent {
            Some(parent) => {
                let parent_tag = self.ctx.graph.get(parent).canonical_name();
                match self.ctx.engine.last_layer(&parent_tag).await {
                    Ok(layer) => layer,
                    Err(e) => {
                        error!(image = %image.name, "親レイヤの取得に失敗しました: {}", e);
                        image.set_status(ImageStatus::Error);
                        return false;
                    }
                }
            }
            None => None,
        };

        if let Err(e) = self.ctx.engine.squash(&canonical, from_layer.as_deref()).await {
            error!(image = %image.name, "squashに失敗しました: {}", e);
            image.set_status(ImageStatus::Error);
            return false;
        }
        true
    }
}

fn extract_archive(archive: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    let file = std::fs::File::open(archive)?;
    let mut tar = tar::Archive::new(file);
    tar.unpack(dest)
}

/// ビルド済みイメージをプッシュするタスク
pub struct PushTask {
    ctx: TaskContext,
    index: usize,
    success: bool,
}

impl PushTask {
    pub fn new(ctx: TaskContext, index: usize) -> Self {
        Self {
            ctx,
            index,
            success: false,
        }
    }

    fn image(&self) -> &kasane_core::Image {
        self.ctx.graph.get(self.index)
    }

    pub async fn run(&mut self) -> bool {
        self.push_image().await;
        let status = self.image().status();
        self.success = !status.is_error() && status != ImageStatus::Unprocessed;
        self.success
    }

    pub fn reset(&mut self) {
        self.success = false;
    }

    async fn push_image(&self) {
        let image = self.image();
        let canonical = image.canonical_name();
        info!(image = %image.name, tag = %canonical, "Pushing image");

        let (repo, tag) = split_image_tag(&canonical);
        match self.ctx.engine.push(&repo, &tag).await {
            Ok(()) => {
                // 前回の失敗状態をクリアする
                image.set_status(ImageStatus::Built);
                info!(image = %image.name, "Image pushed");
            }
            Err(e) if e.is_connection() => {
                error!(image = %image.name, "プッシュ先に接続できません: {}", e);
                image.set_status(ImageStatus::ConnectionError);
            }
            Err(e) => {
                error!(image = %image.name, "プッシュに失敗しました: {}", e);
                image.set_status(ImageStatus::PushError);
            }
        }
    }
}
