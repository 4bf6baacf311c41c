//! コンテナエンジンクライアント
//!
//! Docker API の build / push / 存在確認 / レイヤ履歴をラップします。
//! タスク層はこのトレイト越しにエンジンへ触れるため、テストでは
//! モック実装に差し替えられます。

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::Docker;
use bollard::image::BuildImageOptions;
use futures_util::StreamExt;
use tracing::{debug, info};

use crate::context::ContextBuilder;
use crate::error::{BuildError, Result};

/// 1回のビルド呼び出しに渡すオプション
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub nocache: bool,
    /// ベースイメージをpullする（ルートイメージのみ真にする）
    pub pull: bool,
    pub network_mode: Option<String>,
    pub build_args: HashMap<String, String>,
    /// エンジンのビルドログを書き出すファイル
    pub log_path: Option<PathBuf>,
}

/// コンテナエンジンに要求する操作
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// コンテキストディレクトリからイメージをビルドする
    async fn build(&self, context_dir: &Path, tag: &str, opts: &BuildOptions) -> Result<()>;

    /// ビルド済みイメージをレジストリへプッシュする
    async fn push(&self, repo: &str, tag: &str) -> Result<()>;

    /// ローカルキャッシュにイメージが存在するか
    async fn image_exists(&self, reference: &str) -> Result<bool>;

    /// イメージの最新レイヤIDを返す（squashの起点探索用）
    async fn last_layer(&self, reference: &str) -> Result<Option<String>>;

    /// 指定レイヤ以降をひとつのレイヤに押し潰す
    async fn squash(&self, reference: &str, from_layer: Option<&str>) -> Result<()>;
}

/// bollard による Docker エンジン実装
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build(&self, context_dir: &Path, tag: &str, opts: &BuildOptions) -> Result<()> {
        info!("Building image: {}", tag);

        let context_data = ContextBuilder::create_context(context_dir)?;

        // build_argsを&str型に変換
        let build_args_refs: HashMap<&str, &str> = opts
            .build_args
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let options = BuildImageOptions {
            dockerfile: "Dockerfile",
            t: tag,
            buildargs: build_args_refs,
            nocache: opts.nocache,
            rm: true,      // 中間コンテナを削除
            forcerm: true, // ビルド失敗時も中間コンテナを削除
            pull: opts.pull,
            networkmode: opts.network_mode.as_deref().unwrap_or(""),
            ..Default::default()
        };
        debug!("Build options: {:?}", options);

        let mut log_file = match &opts.log_path {
            Some(path) => Some(std::fs::File::create(path)?),
            None => None,
        };

        use bytes::Bytes;
        use http_body_util::{Either, Full};
        let body = Full::new(Bytes::from(context_data));
        let mut stream = self
            .docker
            .build_image(options, None, Some(Either::Left(body)));

        while let Some(msg) = stream.next().await {
            let output = msg?;

            if let Some(line) = output.stream {
                debug!(image = %tag, "{}", line.trim_end());
                if let Some(file) = log_file.as_mut() {
                    file.write_all(line.as_bytes())?;
                }
            }

            if let Some(error) = output.error {
                return Err(BuildError::BuildFailed(error));
            }
            if let Some(detail) = output.error_detail {
                let message = detail
                    .message
                    .unwrap_or_else(|| "Unknown build error".to_string());
                return Err(BuildError::BuildFailed(message));
            }
        }

        info!("Successfully built: {}", tag);
        Ok(())
    }

    async fn push(&self, repo: &str, tag: &str) -> Result<()> {
        info!("Pushing image: {}:{}", repo, tag);

        #[allow(deprecated)]
        let options = bollard::image::PushImageOptions::<String> {
            tag: tag.to_string(),
        };

        #[allow(deprecated)]
        let mut stream = self.docker.push_image(repo, Some(options), None);

        let mut error_message: Option<String> = None;
        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(err) = info.error {
                error_message = Some(err);
            } else if let Some(status) = info.status {
                debug!(image = %repo, "{}", status);
            }
        }

        if let Some(err) = error_message {
            return Err(BuildError::PushFailed(err));
        }

        info!("Successfully pushed: {}:{}", repo, tag);
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn last_layer(&self, reference: &str) -> Result<Option<String>> {
        let history = self.docker.image_history(reference).await?;
        Ok(history.into_iter().next().map(|entry| entry.id))
    }

    async fn squash(&self, reference: &str, from_layer: Option<&str>) -> Result<()> {
        // squash本体は外部ツールに委譲する
        let mut cmd = tokio::process::Command::new("docker-squash");
        if let Some(layer) = from_layer {
            cmd.arg("-f").arg(layer);
        }
        cmd.arg("-t").arg(reference).arg(reference);

        let output = cmd
            .output()
            .await
            .map_err(|e| BuildError::BuildFailed(format!("docker-squashの実行に失敗しました: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BuildError::BuildFailed(format!(
                "docker-squash 失敗:\n{}",
                stderr
            )));
        }
        Ok(())
    }
}

/// イメージ名とタグを分離
///
/// # Examples
/// - `ghcr.io/org/app:v1.0` -> `("ghcr.io/org/app", "v1.0")`
/// - `ghcr.io/org/app` -> `("ghcr.io/org/app", "latest")`
/// - `localhost:5000/app:dev` -> `("localhost:5000/app", "dev")`
pub fn split_image_tag(image: &str) -> (String, String) {
    // 最後の : を探す
    if let Some(pos) = image.rfind(':') {
        let potential_tag = &image[pos + 1..];
        let potential_image = &image[..pos];

        // タグか、ポート番号かを判定
        // ポート番号は / を含まない純粋な数字
        if !potential_tag.contains('/') && !potential_tag.chars().all(|c| c.is_ascii_digit()) {
            return (potential_image.to_string(), potential_tag.to_string());
        }
    }

    (image.to_string(), "latest".to_string())
}
