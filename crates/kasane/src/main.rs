use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::Parser;
use colored::Colorize;
use tracing::debug;

use kasane_build::{ContainerEngine, DockerEngine, Orchestrator};
use kasane_core::{BuildConfig, ImageGraph, SummaryFormat, dot};

#[derive(Parser)]
#[command(name = "kasane-build")]
#[command(version)]
#[command(about = "依存関係順にコンテナイメージ群をビルドします", long_about = None)]
struct Cli {
    /// ベースディストリビューション (ubuntu, debian, ...)
    #[arg(short, long, default_value = "ubuntu", env = "KASANE_BASE")]
    base: String,

    /// ベースイメージのタグ
    #[arg(long, default_value = "24.04")]
    base_tag: String,

    /// インストール方式 (binary | source)
    #[arg(short = 't', long, default_value = "binary", env = "KASANE_INSTALL_TYPE")]
    install_type: String,

    /// ターゲットアーキテクチャ
    #[arg(long, default_value = "x86_64")]
    base_arch: String,

    /// イメージ名の名前空間
    #[arg(short, long, default_value = "kasane", env = "KASANE_NAMESPACE")]
    namespace: String,

    /// プッシュ先レジストリ
    #[arg(long, env = "KASANE_REGISTRY")]
    registry: Option<String>,

    /// 生成イメージのタグ
    #[arg(long, default_value = "latest")]
    tag: String,

    /// Dockerfileテンプレートを含むディレクトリ
    #[arg(long, default_value = "docker")]
    images_dir: PathBuf,

    /// レンダリング済みコンテキストを置く作業ディレクトリ
    #[arg(long, default_value = ".kasane")]
    work_dir: PathBuf,

    /// イメージ別ビルドログの出力先
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    /// ビルドワーカー数
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// プッシュワーカー数
    #[arg(long, default_value_t = 1)]
    push_threads: usize,

    /// タスクごとの再試行回数
    #[arg(long, default_value_t = 3)]
    retries: usize,

    /// ビルド後にレジストリへプッシュする
    #[arg(long)]
    push: bool,

    /// ビルド後にレイヤを押し潰す
    #[arg(long)]
    squash: bool,

    /// エンジンに既存のイメージをスキップする
    #[arg(long)]
    skip_existing: bool,

    /// 子を持つイメージをスキップする
    #[arg(long)]
    skip_parents: bool,

    /// ビルド対象を絞る正規表現（複数指定可）
    #[arg(long = "regex")]
    regex: Vec<String>,

    /// 展開するプロファイル名（複数指定可）
    #[arg(long = "profile")]
    profile: Vec<String>,

    /// インフラ層イメージの install-type を infra に改名する
    #[arg(long)]
    infra_rename: bool,

    /// インフラ層とみなすイメージ名（複数指定可）
    #[arg(long = "infra-image")]
    infra_images: Vec<String>,

    /// Dockerfileのレンダリングだけ行って終了する
    #[arg(long)]
    template_only: bool,

    /// 依存グラフをGraphviz DOT形式で書き出して終了する
    #[arg(long)]
    save_dependency: Option<PathBuf>,

    /// ビルド対象のイメージ一覧を表示して終了する
    #[arg(long)]
    list_images: bool,

    /// 依存関係ツリーを表示して終了する
    #[arg(long)]
    list_dependencies: bool,

    /// サマリの出力形式 (json | none)
    #[arg(long, default_value = "json")]
    format: SummaryFormat,

    /// レイヤキャッシュを使わない
    #[arg(long)]
    no_cache: bool,

    /// ビルド時のネットワークモード
    #[arg(long)]
    network_mode: Option<String>,

    /// KEY=VALUE 形式のビルド引数（複数指定可）
    #[arg(long = "build-arg", value_parser = parse_key_val)]
    build_args: Vec<(String, String)>,

    /// イメージのメンテナ表記
    #[arg(long, default_value = "Kasane Project")]
    maintainer: String,

    /// 失敗しても全体を失敗扱いにしないイメージ名（複数指定可）
    #[arg(long = "allowed-to-fail")]
    allowed_to_fail: Vec<String>,

    /// ルートイメージのベースをpullしない
    #[arg(long)]
    no_pull: bool,

    /// メインテンプレートに連結するオーバーライド断片（複数指定可）
    #[arg(long = "template-override")]
    template_overrides: Vec<PathBuf>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("KEY=VALUE 形式で指定してください: {}", s))
}

impl Cli {
    fn into_config(self) -> BuildConfig {
        BuildConfig {
            base: self.base,
            base_tag: self.base_tag,
            install_type: self.install_type,
            base_arch: self.base_arch,
            namespace: self.namespace,
            registry: self.registry,
            tag: self.tag,
            images_dir: self.images_dir,
            work_dir: self.work_dir,
            logs_dir: self.logs_dir,
            threads: self.threads,
            push_threads: self.push_threads,
            retries: self.retries,
            push: self.push,
            squash: self.squash,
            skip_existing: self.skip_existing,
            skip_parents: self.skip_parents,
            regex: self.regex,
            profiles: self.profile,
            infra_rename: self.infra_rename,
            infra_images: self.infra_images,
            template_only: self.template_only,
            save_dependency: self.save_dependency,
            list_images: self.list_images,
            list_dependencies: self.list_dependencies,
            format: self.format,
            no_cache: self.no_cache,
            network_mode: self.network_mode,
            build_args: self.build_args.into_iter().collect::<HashMap<_, _>>(),
            maintainer: self.maintainer,
            allowed_to_fail: self.allowed_to_fail,
            pull: !self.no_pull,
            template_overrides: self.template_overrides,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let conf = Arc::new(Cli::parse().into_config());
    conf.validate()?;
    std::fs::create_dir_all(&conf.work_dir)?;

    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerEngine::connect()?);
    let orchestrator = Orchestrator::new(conf.clone(), engine)?;

    if conf.template_only {
        println!(
            "{}",
            format!(
                "Dockerfileを{}件レンダリングしました: {}",
                orchestrator.graph().len(),
                conf.work_dir.join("docker").display()
            )
            .green()
        );
        return Ok(());
    }

    if let Some(path) = &conf.save_dependency {
        orchestrator.filter_images().await?;
        std::fs::write(path, dot::render_dot(orchestrator.graph()))?;
        println!("依存グラフを書き出しました: {}", path.display());
        return Ok(());
    }

    if conf.list_images {
        orchestrator.filter_images().await?;
        for image in orchestrator.graph().iter() {
            if !image.status().is_excluded() {
                println!("{}", image.name);
            }
        }
        return Ok(());
    }

    if conf.list_dependencies {
        orchestrator.filter_images().await?;
        print_dependencies(orchestrator.graph());
        return Ok(());
    }

    // Ctrl-C で協調停止。実行中のタスクは完了させ、新しい試行を始めない
    let stop = orchestrator.stop_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "{}",
                "割り込みを受信しました。実行中のタスクを待って停止します...".yellow()
            );
            stop.store(true, Ordering::SeqCst);
        }
    });

    let summary = orchestrator.run().await?;
    summary.print();
    if conf.format == SummaryFormat::Json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    if summary.has_failures() {
        debug!("失敗したイメージがあるため終了コード1で終了します");
        std::process::exit(1);
    }
    Ok(())
}

/// 依存関係ツリーをルートから表示する
fn print_dependencies(graph: &ImageGraph) {
    fn print_node(graph: &ImageGraph, idx: usize, depth: usize) {
        let image = graph.get(idx);
        if image.status().is_excluded() {
            return;
        }
        println!("{}{}", "  ".repeat(depth), image.name);
        for &child in &image.children {
            print_node(graph, child, depth + 1);
        }
    }

    for idx in 0..graph.len() {
        if graph.get(idx).parent.is_none() {
            print_node(graph, idx, 0);
        }
    }
}
