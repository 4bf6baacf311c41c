//! ビルドオーケストレータ
//!
//! イメージディレクトリの発見と Dockerfile のレンダリング、グラフ構築、
//! フィルタリング、キュー投入、ワーカー群の起動と完了待ちまでを司ります。

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tracing::{debug, info, warn};

use kasane_core::discovery::{self, TEMPLATE_NAME};
use kasane_core::unbuildable::unbuildable_images;
use kasane_core::{
    BuildConfig, CoreError, Image, ImageGraph, ImageSources, ImageStatus, Profiles,
    TemplateRenderer, change_install_type,
};

use crate::engine::ContainerEngine;
use crate::error::Result;
use crate::summary::Summary;
use crate::task::{BuildTask, Task, TaskContext};
use crate::worker::{QueueItem, TaskQueue, Worker};

pub struct Orchestrator {
    conf: Arc<BuildConfig>,
    engine: Arc<dyn ContainerEngine>,
    graph: Arc<ImageGraph>,
    stop: Arc<AtomicBool>,
}

impl Orchestrator {
    /// イメージを発見・レンダリングしてグラフを組み立てる
    pub fn new(conf: Arc<BuildConfig>, engine: Arc<dyn ContainerEngine>) -> Result<Self> {
        let graph = Arc::new(Self::setup_images(&conf)?);
        Ok(Self {
            conf,
            engine,
            graph,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    fn setup_images(conf: &BuildConfig) -> Result<ImageGraph> {
        let dirs = discovery::discover_image_dirs(&conf.images_dir)?;
        let docker_root = conf.work_dir.join("docker");
        let mut renderer = TemplateRenderer::new(conf);
        let mut graph = ImageGraph::new();

        for src_dir in dirs {
            let name = src_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if graph.index_of(&name).is_some() {
                warn!(image = %name, "同名のイメージディレクトリを無視します: {}", src_dir.display());
                continue;
            }

            let context_dir = docker_root.join(&name);
            discovery::copy_dir(&src_dir, &context_dir)?;
            let rendered = renderer.render_dockerfile(
                &src_dir.join(TEMPLATE_NAME),
                &context_dir,
                &conf.template_overrides,
            )?;
            let parent_name = discovery::parse_parent(&rendered);
            let sources = load_sources(&src_dir)?;

            debug!(image = %name, parent = ?parent_name, "Registered image");
            graph.insert(Image::new(
                name.clone(),
                conf.canonical_name(&name),
                context_dir,
                parent_name,
                sources,
            ));
        }

        graph.link();
        Ok(graph)
    }

    pub fn graph(&self) -> &ImageGraph {
        &self.graph
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// フィルタリングを適用して各イメージの状態を確定する
    ///
    /// 適用順: ビルド不能テーブル → 正規表現/プロファイル → infra改名 →
    /// スキップ規則。同じ設定で繰り返し呼んでも結果は変わらない。
    pub async fn filter_images(&self) -> Result<()> {
        self.mark_unbuildable();
        self.apply_matchers()?;
        if self.conf.infra_rename {
            self.rename_infra_images()?;
        }
        self.apply_skip_rules().await;
        Ok(())
    }

    /// ビルド不能テーブルの適用と先祖からの伝播
    fn mark_unbuildable(&self) {
        let unbuildable = unbuildable_images(&self.conf);

        for idx in 0..self.graph.len() {
            let image = self.graph.get(idx);
            let direct = unbuildable.contains(&image.name);
            // 先祖のどれかがビルド不能なら自分もビルドできない
            let inherited = self
                .graph
                .ancestors(idx)
                .iter()
                .any(|&ancestor| unbuildable.contains(&self.graph.get(ancestor).name));

            if direct || inherited {
                debug!(image = %image.name, inherited, "Image is unbuildable");
                image.set_status(ImageStatus::Unbuildable);
            }
        }
    }

    /// 正規表現・プロファイルによる絞り込み
    fn apply_matchers(&self) -> Result<()> {
        let mut patterns = self.conf.regex.clone();
        let profiles = Profiles::load(&self.conf.images_dir)?;
        patterns.extend(profiles.expand(&self.conf.profiles)?);

        if patterns.is_empty() {
            // フィルタ無しならビルド不能以外すべてが対象
            for image in self.graph.iter() {
                if image.status() != ImageStatus::Unbuildable {
                    image.set_status(ImageStatus::Matched);
                }
            }
            return Ok(());
        }

        let matcher = regex::RegexSet::new(&patterns).map_err(CoreError::Regex)?;
        let mut matched = vec![false; self.graph.len()];

        for idx in 0..self.graph.len() {
            if self.graph.get(idx).status() == ImageStatus::Unbuildable {
                continue;
            }
            if matcher.is_match(&self.graph.get(idx).name) {
                matched[idx] = true;
                // 依存チェーンが通るよう先祖も強制的に対象へ
                for &ancestor in &self.graph.ancestors(idx) {
                    if self.graph.get(ancestor).status() != ImageStatus::Unbuildable {
                        matched[ancestor] = true;
                    }
                }
            }
        }

        for idx in 0..self.graph.len() {
            let image = self.graph.get(idx);
            if image.status() == ImageStatus::Unbuildable {
                continue;
            }
            image.set_status(if matched[idx] {
                ImageStatus::Matched
            } else {
                ImageStatus::Unmatched
            });
        }
        Ok(())
    }

    /// インフラ層イメージの install-type セグメントを infra に改名する
    ///
    /// リンクはインデックスで張られているため改名で壊れないが、
    /// 子の Dockerfile の FROM 行は新しい名前に追従させる必要がある。
    fn rename_infra_images(&self) -> Result<()> {
        for idx in 0..self.graph.len() {
            if !self.is_infra(idx) {
                continue;
            }
            let image = self.graph.get(idx);
            let old = image.canonical_name();
            change_install_type(image, &self.conf.install_type, "infra");
            let new = image.canonical_name();
            if old == new {
                continue;
            }
            info!(image = %image.name, %old, %new, "Renamed infra image");

            for &child in &image.children {
                let dockerfile = self.graph.get(child).path.join("Dockerfile");
                let content = std::fs::read_to_string(&dockerfile)?;
                std::fs::write(&dockerfile, content.replace(&old, &new))?;
            }
        }
        Ok(())
    }

    /// 名前または先祖でインフラ層かどうかを判定する
    fn is_infra(&self, idx: usize) -> bool {
        let image = self.graph.get(idx);
        if self.conf.infra_images.contains(&image.name) {
            return true;
        }
        self.graph
            .ancestors(idx)
            .iter()
            .any(|&ancestor| self.conf.infra_images.contains(&self.graph.get(ancestor).name))
    }

    /// skip_existing / skip_parents の適用
    async fn apply_skip_rules(&self) {
        if self.conf.skip_existing {
            for image in self.graph.iter() {
                if image.status() != ImageStatus::Matched {
                    continue;
                }
                match self.engine.image_exists(&image.canonical_name()).await {
                    Ok(true) => {
                        info!(image = %image.name, "既存のイメージをスキップします");
                        image.set_status(ImageStatus::Skipped);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(image = %image.name, "存在確認に失敗したためビルド対象に残します: {}", e);
                    }
                }
            }
        }

        if self.conf.skip_parents {
            for image in self.graph.iter() {
                // 子だけが欲しいなら、すぐ差し替わる親を作り直す意味はない
                if image.status() == ImageStatus::Matched && !image.children.is_empty() {
                    info!(image = %image.name, "子を持つイメージをスキップします");
                    image.set_status(ImageStatus::Skipped);
                }
            }
        }
    }

    fn task_context(&self) -> TaskContext {
        TaskContext {
            graph: self.graph.clone(),
            conf: self.conf.clone(),
            engine: self.engine.clone(),
        }
    }

    /// グラフのルートをビルドキューへ投入する
    ///
    /// ルートとは、親が無いか、親がスキップ済みのイメージ。スキップ済みの
    /// 親はタスクが走らず後続投入が起きないため、ここで直接積む。
    pub fn seed_queue(&self, queue: &TaskQueue) -> usize {
        let ctx = self.task_context();
        let mut seeded = 0;

        for idx in 0..self.graph.len() {
            let image = self.graph.get(idx);
            if image.status().is_excluded() {
                continue;
            }
            let rooted = match image.parent {
                None => true,
                Some(parent) => self.graph.get(parent).status() == ImageStatus::Skipped,
            };
            if rooted {
                debug!(image = %image.name, "Seeding build task");
                queue.put(QueueItem::Task(Box::new(Task::Build(BuildTask::new(
                    ctx.clone(),
                    idx,
                )))));
                seeded += 1;
            }
        }
        seeded
    }

    /// フィルタリングからワーカー完了までを実行して結果を返す
    pub async fn run(&self) -> Result<Summary> {
        self.filter_images().await?;

        if let Some(logs_dir) = &self.conf.logs_dir {
            std::fs::create_dir_all(logs_dir)?;
        }

        let build_queue = Arc::new(TaskQueue::new());
        let push_queue = Arc::new(TaskQueue::new());
        let seeded = self.seed_queue(&build_queue);
        info!(
            seeded,
            threads = self.conf.threads,
            push_threads = self.conf.push_threads,
            "Starting build pipeline"
        );

        let ctx = self.task_context();
        let mut handles = Vec::new();
        for i in 0..self.conf.threads {
            let worker = Worker::new(
                format!("build-{}", i),
                build_queue.clone(),
                build_queue.clone(),
                push_queue.clone(),
                ctx.clone(),
                self.conf.retries,
                self.stop.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
        }
        for i in 0..self.conf.push_threads {
            let worker = Worker::new(
                format!("push-{}", i),
                push_queue.clone(),
                build_queue.clone(),
                push_queue.clone(),
                ctx.clone(),
                self.conf.retries,
                self.stop.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        // 両キューが掃けるまで待ってからワーカーを止める
        while build_queue.unfinished() > 0 || push_queue.unfinished() > 0 {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        build_queue.put(QueueItem::Tombstone);
        push_queue.put(QueueItem::Tombstone);
        for handle in handles {
            let _ = handle.await;
        }

        Ok(self.summary())
    }

    pub fn summary(&self) -> Summary {
        Summary::from_graph(&self.graph, &self.conf.allowed_to_fail)
    }
}

/// イメージソースディレクトリの `sources.json` を読み込む
fn load_sources(src_dir: &Path) -> Result<ImageSources> {
    let path = src_dir.join("sources.json");
    if !path.exists() {
        return Ok(ImageSources::default());
    }
    let content = std::fs::read_to_string(&path).map_err(CoreError::Io)?;
    let sources = serde_json::from_str(&content).map_err(|e| CoreError::SourceParse {
        path,
        message: e.to_string(),
    })?;
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockEngine;
    use std::fs;

    fn write_image(images_dir: &Path, name: &str, from: &str) {
        let dir = images_dir.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(TEMPLATE_NAME),
            format!("FROM {}\nRUN echo {}\n", from, name),
        )
        .unwrap();
    }

    /// base <- app <- app-plugin の3段チェーンと独立した other
    fn chain_fixture(conf: &BuildConfig, images_dir: &Path) {
        write_image(images_dir, "base", "ubuntu:24.04");
        write_image(images_dir, "app", &conf.canonical_name("base"));
        write_image(images_dir, "app-plugin", &conf.canonical_name("app"));
        write_image(images_dir, "other", "debian:12");
    }

    fn test_conf(root: &Path) -> BuildConfig {
        BuildConfig {
            images_dir: root.join("images"),
            work_dir: root.join("work"),
            threads: 2,
            push_threads: 1,
            retries: 0,
            ..Default::default()
        }
    }

    fn orchestrator(conf: BuildConfig) -> (Orchestrator, Arc<MockEngine>) {
        fs::create_dir_all(&conf.images_dir).ok();
        let engine = Arc::new(MockEngine::new());
        let orchestrator = Orchestrator::new(Arc::new(conf), engine.clone()).unwrap();
        (orchestrator, engine)
    }

    fn status_of(orchestrator: &Orchestrator, name: &str) -> ImageStatus {
        orchestrator.graph().by_name(name).unwrap().status()
    }

    #[tokio::test]
    async fn test_chain_is_seeded_from_root_only() {
        let temp_dir = tempfile::tempdir().unwrap();
        let conf = test_conf(temp_dir.path());
        chain_fixture(&conf, &conf.images_dir);

        let (orchestrator, _engine) = orchestrator(conf);
        orchestrator.filter_images().await.unwrap();

        // フィルタ無しなら全イメージが対象
        for name in ["base", "app", "app-plugin", "other"] {
            assert_eq!(status_of(&orchestrator, name), ImageStatus::Matched);
        }

        // ルート (base, other) だけが初期投入される
        let queue = TaskQueue::new();
        assert_eq!(orchestrator.seed_queue(&queue), 2);
    }

    #[tokio::test]
    async fn test_run_builds_parents_before_children() {
        let temp_dir = tempfile::tempdir().unwrap();
        let conf = test_conf(temp_dir.path());
        chain_fixture(&conf, &conf.images_dir);

        let (orchestrator, engine) = orchestrator(conf.clone());
        let summary = orchestrator.run().await.unwrap();

        let mut built = summary.built.clone();
        built.sort();
        assert_eq!(built, vec!["app", "app-plugin", "base", "other"]);
        assert!(summary.failed.is_empty());

        // 親は必ず子より先にビルドされる
        let order = engine.build_order();
        let position = |name: &str| {
            order
                .iter()
                .position(|tag| tag == &conf.canonical_name(name))
                .unwrap()
        };
        assert!(position("base") < position("app"));
        assert!(position("app") < position("app-plugin"));
    }

    #[tokio::test]
    async fn test_failed_parent_leaves_children_unbuilt() {
        let temp_dir = tempfile::tempdir().unwrap();
        let conf = test_conf(temp_dir.path());
        chain_fixture(&conf, &conf.images_dir);

        let (orchestrator, engine) = orchestrator(conf.clone());
        engine.fail_build(&conf.canonical_name("base"));

        let summary = orchestrator.run().await.unwrap();

        assert_eq!(status_of(&orchestrator, "base"), ImageStatus::Error);
        // 失敗した親の子にはタスクが投入されず、エンジンも呼ばれない
        assert_eq!(engine.build_count(&conf.canonical_name("app")), 0);
        assert!(summary.failed.iter().any(|f| f.name == "base"));
        assert!(summary.built.contains(&"other".to_string()));
    }

    #[tokio::test]
    async fn test_skip_parents_reroots_children() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(temp_dir.path());
        conf.skip_parents = true;
        write_image(&conf.images_dir, "base", "ubuntu:24.04");
        write_image(&conf.images_dir, "app", &conf.canonical_name("base"));
        write_image(&conf.images_dir, "worker", &conf.canonical_name("base"));

        let (orchestrator, _engine) = orchestrator(conf);
        orchestrator.filter_images().await.unwrap();

        assert_eq!(status_of(&orchestrator, "base"), ImageStatus::Skipped);
        assert_eq!(status_of(&orchestrator, "app"), ImageStatus::Matched);
        assert_eq!(status_of(&orchestrator, "worker"), ImageStatus::Matched);

        // 親がスキップ済みの子はルートとして直接投入される
        let queue = TaskQueue::new();
        assert_eq!(orchestrator.seed_queue(&queue), 2);
    }

    #[tokio::test]
    async fn test_skip_existing_images() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(temp_dir.path());
        conf.skip_existing = true;
        chain_fixture(&conf, &conf.images_dir);

        let (orchestrator, engine) = orchestrator(conf.clone());
        engine.add_existing(&conf.canonical_name("base"));

        orchestrator.filter_images().await.unwrap();

        assert_eq!(status_of(&orchestrator, "base"), ImageStatus::Skipped);
        assert_eq!(status_of(&orchestrator, "app"), ImageStatus::Matched);
    }

    #[tokio::test]
    async fn test_regex_promotes_ancestors_to_matched() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(temp_dir.path());
        conf.regex = vec!["^app-plugin$".to_string()];
        chain_fixture(&conf, &conf.images_dir);

        let (orchestrator, _engine) = orchestrator(conf);
        orchestrator.filter_images().await.unwrap();

        // 一致した本体と、その依存チェーン全体が対象になる
        assert_eq!(status_of(&orchestrator, "app-plugin"), ImageStatus::Matched);
        assert_eq!(status_of(&orchestrator, "app"), ImageStatus::Matched);
        assert_eq!(status_of(&orchestrator, "base"), ImageStatus::Matched);
        assert_eq!(status_of(&orchestrator, "other"), ImageStatus::Unmatched);
    }

    #[tokio::test]
    async fn test_unbuildable_propagates_to_descendants() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(temp_dir.path());
        // 静的テーブルの debian エントリに sysprobe が載っている
        conf.base = "debian".to_string();
        conf.base_tag = "12".to_string();
        write_image(&conf.images_dir, "sysprobe", "debian:12");
        write_image(
            &conf.images_dir,
            "sysprobe-exporter",
            &conf.canonical_name("sysprobe"),
        );
        write_image(&conf.images_dir, "base", "debian:12");

        let (orchestrator, _engine) = orchestrator(conf);
        orchestrator.filter_images().await.unwrap();

        assert_eq!(status_of(&orchestrator, "sysprobe"), ImageStatus::Unbuildable);
        // テーブルに無くても先祖経由でビルド不能になる
        assert_eq!(
            status_of(&orchestrator, "sysprobe-exporter"),
            ImageStatus::Unbuildable
        );
        assert_eq!(status_of(&orchestrator, "base"), ImageStatus::Matched);
    }

    #[tokio::test]
    async fn test_filter_images_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(temp_dir.path());
        conf.regex = vec!["^app$".to_string()];
        conf.skip_parents = true;
        chain_fixture(&conf, &conf.images_dir);

        let (orchestrator, _engine) = orchestrator(conf);

        orchestrator.filter_images().await.unwrap();
        let first: Vec<_> = orchestrator.graph().iter().map(|i| i.status()).collect();

        orchestrator.filter_images().await.unwrap();
        let second: Vec<_> = orchestrator.graph().iter().map(|i| i.status()).collect();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_infra_rename_updates_children_dockerfiles() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(temp_dir.path());
        conf.infra_rename = true;
        conf.infra_images = vec!["base".to_string()];
        write_image(&conf.images_dir, "base", "ubuntu:24.04");
        write_image(&conf.images_dir, "app", &conf.canonical_name("base"));
        write_image(&conf.images_dir, "standalone", "alpine:3");

        let (orchestrator, _engine) = orchestrator(conf.clone());
        orchestrator.filter_images().await.unwrap();

        let base = orchestrator.graph().by_name("base").unwrap();
        assert_eq!(
            base.canonical_name(),
            "kasane/ubuntu-infra-base:latest"
        );
        // 先祖がインフラ層なら子も改名される
        let app = orchestrator.graph().by_name("app").unwrap();
        assert_eq!(app.canonical_name(), "kasane/ubuntu-infra-app:latest");
        // 無関係なイメージはそのまま
        let standalone = orchestrator.graph().by_name("standalone").unwrap();
        assert_eq!(
            standalone.canonical_name(),
            "kasane/ubuntu-binary-standalone:latest"
        );

        // 子の FROM 行は新しい親名に追従している
        let dockerfile = fs::read_to_string(app.path.join("Dockerfile")).unwrap();
        assert!(dockerfile.contains("FROM kasane/ubuntu-infra-base:latest"));

        // リンクはインデックスベースなので改名後も保たれている
        assert_eq!(
            app.parent,
            orchestrator.graph().index_of("base")
        );
    }

    #[tokio::test]
    async fn test_sources_json_is_loaded() {
        let temp_dir = tempfile::tempdir().unwrap();
        let conf = test_conf(temp_dir.path());
        write_image(&conf.images_dir, "base", "ubuntu:24.04");
        fs::write(
            conf.images_dir.join("base/sources.json"),
            r#"{"source": {"name": "base", "type": "url", "location": "https://example.com/base.tar"}}"#,
        )
        .unwrap();

        let (orchestrator, _engine) = orchestrator(conf);
        let base = orchestrator.graph().by_name("base").unwrap();
        assert!(base.sources.source.is_some());
    }

    #[test]
    fn test_missing_images_dir_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let conf = BuildConfig {
            images_dir: temp_dir.path().join("nope"),
            work_dir: temp_dir.path().join("work"),
            ..Default::default()
        };
        let engine = Arc::new(MockEngine::new());
        let result = Orchestrator::new(Arc::new(conf), engine);
        assert!(result.is_err());
    }
}
