//! kasane のコアモデル
//!
//! ビルド対象イメージのモデルとグラフ、ビルド設定、フィルタリングの
//! 静的テーブル、Dockerfile テンプレートのレンダリングを提供します。
//! コンテナエンジンとの通信やタスク実行は kasane-build 側にあります。

pub mod config;
pub mod discovery;
pub mod dot;
pub mod error;
pub mod graph;
pub mod image;
pub mod profile;
pub mod template;
pub mod unbuildable;

pub use config::{BuildConfig, SummaryFormat};
pub use error::{CoreError, Result};
pub use graph::ImageGraph;
pub use image::{Image, ImageSources, ImageStatus, SourceOrigin, SourceSpec, change_install_type};
pub use profile::Profiles;
pub use template::TemplateRenderer;
