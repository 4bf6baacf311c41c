use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(
        "イメージディレクトリが見つかりません: {0}\nヒント: --images-dir でDockerfileテンプレートを含むディレクトリを指定してください"
    )]
    ImagesDirNotFound(PathBuf),

    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("テンプレート展開エラー: {file}\n理由: {message}")]
    Template { file: PathBuf, message: String },

    #[error("プロファイルが見つかりません: {0}")]
    ProfileNotFound(String),

    #[error("プロファイル定義の解析に失敗しました: {path}\n理由: {message}")]
    ProfileParse { path: PathBuf, message: String },

    #[error("ソース定義の解析に失敗しました: {path}\n理由: {message}")]
    SourceParse { path: PathBuf, message: String },

    #[error("正規表現エラー: {0}")]
    Regex(#[from] regex::Error),

    #[error("無効な設定: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
