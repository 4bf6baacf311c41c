//! ビルド設定
//!
//! CLI から一度だけ構築する不変の設定です。コンポーネントには
//! `Arc<BuildConfig>` で渡し、グローバルな可変状態は持ちません。

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// サマリの出力形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SummaryFormat {
    #[default]
    Json,
    None,
}

impl FromStr for SummaryFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "json" => Ok(SummaryFormat::Json),
            "none" => Ok(SummaryFormat::None),
            other => Err(format!("無効な出力形式です: {} (json | none)", other)),
        }
    }
}

/// プロキシ関連でビルド引数へ引き継ぐ環境変数
const PROXY_VARS: &[&str] = &[
    "HTTP_PROXY", "http_proxy", "HTTPS_PROXY", "https_proxy", "FTP_PROXY", "ftp_proxy",
    "NO_PROXY", "no_proxy",
];

/// ビルドパイプライン全体の設定
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// ベースディストリビューション (ubuntu, debian, ...)
    pub base: String,
    /// ベースイメージのタグ
    pub base_tag: String,
    /// インストール方式 (binary | source)
    pub install_type: String,
    /// ターゲットアーキテクチャ
    pub base_arch: String,
    /// イメージ名の名前空間
    pub namespace: String,
    /// プッシュ先レジストリ（省略時はローカルのみ）
    pub registry: Option<String>,
    /// 生成イメージのタグ
    pub tag: String,
    /// Dockerfile テンプレートを含むソースディレクトリ
    pub images_dir: PathBuf,
    /// レンダリング済みコンテキストを置く作業ディレクトリ
    pub work_dir: PathBuf,
    /// イメージ別ビルドログの出力先
    pub logs_dir: Option<PathBuf>,
    /// ビルドワーカー数
    pub threads: usize,
    /// プッシュワーカー数
    pub push_threads: usize,
    /// タスクごとの再試行回数
    pub retries: usize,
    pub push: bool,
    pub squash: bool,
    /// エンジンに既存のイメージをスキップ
    pub skip_existing: bool,
    /// 子を持つイメージをスキップ
    pub skip_parents: bool,
    /// ビルド対象を絞る正規表現
    pub regex: Vec<String>,
    /// 展開するプロファイル名
    pub profiles: Vec<String>,
    /// インフラ層イメージの install-type を infra に改名する
    pub infra_rename: bool,
    /// インフラ層とみなすイメージ名（名前または先祖で判定）
    pub infra_images: Vec<String>,
    pub template_only: bool,
    /// 依存グラフを DOT で書き出すパス
    pub save_dependency: Option<PathBuf>,
    pub list_images: bool,
    pub list_dependencies: bool,
    pub format: SummaryFormat,
    pub no_cache: bool,
    pub network_mode: Option<String>,
    /// 明示的なビルド引数（プロキシ環境変数より優先）
    pub build_args: HashMap<String, String>,
    pub maintainer: String,
    /// 失敗してもビルド全体を失敗扱いにしないイメージ名
    pub allowed_to_fail: Vec<String>,
    /// ルートイメージのベースを常にpullする
    pub pull: bool,
    /// メインテンプレートに連結するオーバーライド断片
    pub template_overrides: Vec<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            base: "ubuntu".to_string(),
            base_tag: "24.04".to_string(),
            install_type: "binary".to_string(),
            base_arch: "x86_64".to_string(),
            namespace: "kasane".to_string(),
            registry: None,
            tag: "latest".to_string(),
            images_dir: PathBuf::from("docker"),
            work_dir: PathBuf::from(".kasane"),
            logs_dir: None,
            threads: 8,
            push_threads: 1,
            retries: 3,
            push: false,
            squash: false,
            skip_existing: false,
            skip_parents: false,
            regex: Vec::new(),
            profiles: Vec::new(),
            infra_rename: false,
            infra_images: Vec::new(),
            template_only: false,
            save_dependency: None,
            list_images: false,
            list_dependencies: false,
            format: SummaryFormat::Json,
            no_cache: false,
            network_mode: None,
            build_args: HashMap::new(),
            maintainer: "Kasane Project".to_string(),
            allowed_to_fail: Vec::new(),
            pull: true,
            template_overrides: Vec::new(),
        }
    }
}

impl BuildConfig {
    /// イメージ名の接頭辞 (`{base}-{install_type}-`)
    pub fn image_prefix(&self) -> String {
        format!("{}-{}-", self.base, self.install_type)
    }

    /// ベース名から完全修飾名を組み立てる
    ///
    /// `[registry/]namespace/{base}-{install_type}-{name}:{tag}`
    pub fn canonical_name(&self, name: &str) -> String {
        let repo = format!("{}/{}{}", self.namespace, self.image_prefix(), name);
        match &self.registry {
            Some(registry) => format!("{}/{}:{}", registry, repo, self.tag),
            None => format!("{}:{}", repo, self.tag),
        }
    }

    /// プロキシ環境変数と明示的なビルド引数をマージする
    ///
    /// 同じキーは明示的な指定が勝つ。
    pub fn effective_build_args(&self) -> HashMap<String, String> {
        let mut args = HashMap::new();
        for key in PROXY_VARS {
            if let Ok(value) = std::env::var(key) {
                if !value.is_empty() {
                    args.insert(key.to_string(), value);
                }
            }
        }
        args.extend(self.build_args.clone());
        args
    }

    pub fn validate(&self) -> Result<()> {
        if self.install_type != "binary" && self.install_type != "source" {
            return Err(CoreError::InvalidConfig(format!(
                "install-type は binary か source を指定してください: {}",
                self.install_type
            )));
        }
        if self.threads == 0 || self.push_threads == 0 {
            return Err(CoreError::InvalidConfig(
                "ワーカー数は1以上を指定してください".to_string(),
            ));
        }
        Ok(())
    }
}
