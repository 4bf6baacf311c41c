//! イメージモデル
//!
//! ビルド対象イメージ1件の識別情報・依存関係・状態を保持します。
//! 親子リンクはアリーナ ([`crate::graph::ImageGraph`]) のインデックスで
//! 張るため、canonical name を後から書き換えてもリンクは壊れません。

use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// イメージのビルド状態
///
/// 状態を書き換えるのはオーケストレータのフィルタリングと、
/// そのイメージを駆動中のタスクだけ。1イメージを同時に駆動する
/// タスクは常に1つ（キュー投入側の不変条件）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Unprocessed,
    Matched,
    Unmatched,
    Skipped,
    Unbuildable,
    Building,
    Built,
    Error,
    ConnectionError,
    PushError,
    ParentError,
}

impl ImageStatus {
    /// エラー系の状態かどうか
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ImageStatus::Error
                | ImageStatus::ConnectionError
                | ImageStatus::PushError
                | ImageStatus::ParentError
        )
    }

    /// ビルド対象から外れた終端状態かどうか
    ///
    /// この状態のイメージにはタスクを投入しない。
    pub fn is_excluded(&self) -> bool {
        matches!(
            self,
            ImageStatus::Unmatched | ImageStatus::Skipped | ImageStatus::Unbuildable
        )
    }
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ImageStatus::Unprocessed => "unprocessed",
            ImageStatus::Matched => "matched",
            ImageStatus::Unmatched => "unmatched",
            ImageStatus::Skipped => "skipped",
            ImageStatus::Unbuildable => "unbuildable",
            ImageStatus::Building => "building",
            ImageStatus::Built => "built",
            ImageStatus::Error => "error",
            ImageStatus::ConnectionError => "connection_error",
            ImageStatus::PushError => "push_error",
            ImageStatus::ParentError => "parent_error",
        };
        f.write_str(s)
    }
}

/// ソースの取得元
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceOrigin {
    /// HTTP(S) で取得するアーカイブ
    Url,
    /// git クローンしてアーカイブ化
    Git { reference: String },
    /// ローカルのファイルまたはディレクトリ
    Local,
}

/// ソース取得の記述子
///
/// `sources.json` の1エントリに対応する。
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    #[serde(flatten)]
    pub origin: SourceOrigin,
    pub location: String,
}

/// 1イメージ分のソース定義
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageSources {
    /// 主ソース
    pub source: Option<SourceSpec>,
    /// install-type が source のときにコンテキストへ展開するプラグイン
    #[serde(default)]
    pub plugins: Vec<SourceSpec>,
    /// 同じく追加アーカイブ
    #[serde(default)]
    pub additions: Vec<SourceSpec>,
}

/// ビルド対象イメージ1件
#[derive(Debug)]
pub struct Image {
    /// ベース名（ソースディレクトリ名）。グラフの検索キーであり改名されない。
    pub name: String,
    /// レジストリ/名前空間込みの完全修飾名。infra 改名で書き換わる。
    canonical_name: RwLock<String>,
    /// レンダリング済み Dockerfile を含むビルドコンテキスト
    pub path: PathBuf,
    /// Dockerfile の FROM 行から取り出した親イメージ参照
    pub parent_name: Option<String>,
    /// 親のアリーナインデックス（リンク後に確定。外部ベースならNone）
    pub parent: Option<usize>,
    /// 子のアリーナインデックス
    pub children: Vec<usize>,
    status: RwLock<ImageStatus>,
    /// ソース取得定義
    pub sources: ImageSources,
}

impl Image {
    pub fn new(
        name: impl Into<String>,
        canonical_name: impl Into<String>,
        path: PathBuf,
        parent_name: Option<String>,
        sources: ImageSources,
    ) -> Self {
        Self {
            name: name.into(),
            canonical_name: RwLock::new(canonical_name.into()),
            path,
            parent_name,
            parent: None,
            children: Vec::new(),
            status: RwLock::new(ImageStatus::Unprocessed),
            sources,
        }
    }

    pub fn status(&self) -> ImageStatus {
        *self.status.read().expect("image status lock poisoned")
    }

    pub fn set_status(&self, status: ImageStatus) {
        *self.status.write().expect("image status lock poisoned") = status;
    }

    pub fn canonical_name(&self) -> String {
        self.canonical_name
            .read()
            .expect("image name lock poisoned")
            .clone()
    }

    pub fn set_canonical_name(&self, canonical: impl Into<String>) {
        *self.canonical_name.write().expect("image name lock poisoned") = canonical.into();
    }
}

impl Clone for Image {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            canonical_name: RwLock::new(self.canonical_name()),
            path: self.path.clone(),
            parent_name: self.parent_name.clone(),
            parent: self.parent,
            children: self.children.clone(),
            status: RwLock::new(self.status()),
            sources: self.sources.clone(),
        }
    }
}

/// canonical name の install-type セグメントを書き換える
///
/// 検索キー (`Image::name`) には触れないため、グラフのリンクは保たれる。
/// `from` セグメントが含まれない名前には何もしない。
pub fn change_install_type(image: &Image, from: &str, to: &str) {
    let needle = format!("-{}-", from);
    let replacement = format!("-{}-", to);
    let renamed = image.canonical_name().replace(&needle, &replacement);
    image.set_canonical_name(renamed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(name: &str, canonical: &str) -> Image {
        Image::new(
            name,
            canonical,
            PathBuf::from("/tmp"),
            None,
            ImageSources::default(),
        )
    }

    #[test]
    fn test_status_is_error() {
        assert!(ImageStatus::Error.is_error());
        assert!(ImageStatus::ConnectionError.is_error());
        assert!(ImageStatus::PushError.is_error());
        assert!(ImageStatus::ParentError.is_error());
        assert!(!ImageStatus::Built.is_error());
        assert!(!ImageStatus::Skipped.is_error());
    }

    #[test]
    fn test_status_is_excluded() {
        assert!(ImageStatus::Unmatched.is_excluded());
        assert!(ImageStatus::Skipped.is_excluded());
        assert!(ImageStatus::Unbuildable.is_excluded());
        assert!(!ImageStatus::Matched.is_excluded());
        assert!(!ImageStatus::Error.is_excluded());
    }

    #[test]
    fn test_change_install_type_roundtrip() {
        let img = image("app", "registry.example.com/kasane/ubuntu-source-app:1.0");
        let original = img.canonical_name();

        change_install_type(&img, "source", "infra");
        assert_eq!(
            img.canonical_name(),
            "registry.example.com/kasane/ubuntu-infra-app:1.0"
        );

        change_install_type(&img, "infra", "source");
        assert_eq!(img.canonical_name(), original);
    }

    #[test]
    fn test_change_install_type_without_segment() {
        // セグメントが無ければ何も変わらない
        let img = image("base", "kasane/ubuntu-binary-base:1.0");
        change_install_type(&img, "source", "infra");
        assert_eq!(img.canonical_name(), "kasane/ubuntu-binary-base:1.0");
    }

    #[test]
    fn test_source_spec_deserialize() {
        let json = r#"{
            "source": {"name": "app", "type": "git", "location": "https://example.com/app.git", "reference": "v1.2.0"},
            "plugins": [{"name": "extra", "type": "url", "location": "https://example.com/extra.tar"}]
        }"#;
        let sources: ImageSources = serde_json::from_str(json).unwrap();

        let source = sources.source.unwrap();
        assert_eq!(source.name, "app");
        assert_eq!(
            source.origin,
            SourceOrigin::Git {
                reference: "v1.2.0".to_string()
            }
        );
        assert_eq!(sources.plugins.len(), 1);
        assert_eq!(sources.plugins[0].origin, SourceOrigin::Url);
        assert!(sources.additions.is_empty());
    }
}
