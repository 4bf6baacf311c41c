//! Dockerfile テンプレートのレンダリング
//!
//! Tera を使って `Dockerfile.j2` を具象 Dockerfile に展開します。
//! テンプレートの継承は、オーバーライド断片を `{% extends %}` ヘッダを
//! 取り除いた上で本体に連結することで表現します。

use std::path::Path;

use tera::{Context, Tera};
use tracing::debug;

use crate::config::BuildConfig;
use crate::error::{CoreError, Result};

/// 変数コンテキスト
pub type Variables = std::collections::HashMap<String, serde_json::Value>;

/// Dockerfile テンプレートのレンダラ
pub struct TemplateRenderer {
    tera: Tera,
    context: Context,
}

impl TemplateRenderer {
    /// 設定から標準変数を積んだレンダラを作る
    pub fn new(conf: &BuildConfig) -> Self {
        let mut context = Context::new();
        context.insert("base_distro", &conf.base);
        context.insert("base_tag", &conf.base_tag);
        context.insert("base_arch", &conf.base_arch);
        context.insert("install_type", &conf.install_type);
        context.insert("namespace", &conf.namespace);
        context.insert("tag", &conf.tag);
        context.insert("image_prefix", &conf.image_prefix());
        context.insert("maintainer", &conf.maintainer);
        context.insert("version", env!("CARGO_PKG_VERSION"));
        context.insert(
            "build_date",
            &chrono::Utc::now().format("%Y%m%d").to_string(),
        );
        context.insert(
            "package_manager",
            if conf.base == "debian" || conf.base == "ubuntu" {
                "apt"
            } else {
                "dnf"
            },
        );

        Self {
            tera: Tera::default(),
            context,
        }
    }

    /// 変数を追加
    pub fn add_variable(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.context.insert(key.into(), &value);
    }

    /// 複数の変数を追加
    pub fn add_variables(&mut self, variables: Variables) {
        for (key, value) in variables {
            self.context.insert(key, &value);
        }
    }

    /// テンプレートとオーバーライド断片を連結してレンダリングする
    pub fn render(&mut self, template_path: &Path, overrides: &[std::path::PathBuf]) -> Result<String> {
        let mut template = std::fs::read_to_string(template_path)?;
        for fragment_path in overrides {
            let fragment = std::fs::read_to_string(fragment_path)?;
            template.push('\n');
            template.push_str(&strip_extends(&fragment));
        }

        self.tera
            .render_str(&template, &self.context)
            .map_err(|e| CoreError::Template {
                file: template_path.to_path_buf(),
                message: tera_error_detail(&e),
            })
    }

    /// イメージディレクトリのテンプレートを Dockerfile として書き出す
    pub fn render_dockerfile(
        &mut self,
        template_path: &Path,
        out_dir: &Path,
        overrides: &[std::path::PathBuf],
    ) -> Result<String> {
        let rendered = self.render(template_path, overrides)?;
        let out_path = out_dir.join("Dockerfile");
        std::fs::write(&out_path, &rendered)?;
        debug!(path = %out_path.display(), "Rendered Dockerfile");
        Ok(rendered)
    }
}

/// `{% extends ... %}` ヘッダ行を取り除く
fn strip_extends(fragment: &str) -> String {
    fragment
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !(trimmed.starts_with("{%") && trimmed.contains("extends"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tera のエラーから原因チェーンをたどって詳細を組み立てる
fn tera_error_detail(e: &tera::Error) -> String {
    let mut detail = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        detail.push_str(&format!("\n原因: {}", cause));
        source = cause.source();
    }
    detail
}
