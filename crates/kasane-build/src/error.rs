use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(
        "Dockerに接続できません: {0}\n\nヒント:\n  • Dockerが起動しているか確認してください\n  • DOCKER_HOST の設定を確認してください"
    )]
    Connection(String),

    #[error("ビルドに失敗しました: {0}")]
    BuildFailed(String),

    #[error("プッシュに失敗しました: {0}")]
    PushFailed(String),

    #[error("Docker APIエラー: {0}")]
    Api(String),

    #[error("ソース取得に失敗しました: {0}")]
    Fetch(String),

    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] kasane_core::CoreError),
}

impl From<bollard::errors::Error> for BuildError {
    fn from(err: bollard::errors::Error) -> Self {
        match &err {
            bollard::errors::Error::DockerResponseServerError { .. } => {
                BuildError::Api(err.to_string())
            }
            _ => {
                // 接続エラーの可能性をチェック
                let err_str = err.to_string();
                if err_str.contains("Connection refused")
                    || err_str.contains("No such file or directory")
                    || err_str.contains("connection closed")
                    || err_str.contains("timed out")
                {
                    BuildError::Connection(err_str)
                } else {
                    BuildError::Api(err_str)
                }
            }
        }
    }
}

impl BuildError {
    /// エンジンへ到達できない種類のエラーかどうか
    pub fn is_connection(&self) -> bool {
        matches!(self, BuildError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
