//! イメージディレクトリの発見
//!
//! 規約ベースでビルド対象を見つけます。イメージソースディレクトリ配下で
//! `Dockerfile.j2` を含むディレクトリが1イメージに対応します。

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{CoreError, Result};

/// Dockerfile テンプレートのファイル名
pub const TEMPLATE_NAME: &str = "Dockerfile.j2";

/// イメージソースディレクトリを再帰的に発見する
///
/// アルファベット順にソートして返す
pub fn discover_image_dirs(images_dir: &Path) -> Result<Vec<PathBuf>> {
    if !images_dir.is_dir() {
        return Err(CoreError::ImagesDirNotFound(images_dir.to_path_buf()));
    }

    let mut dirs = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(images_dir, &mut dirs, &mut visited)?;
    dirs.sort();

    info!(count = dirs.len(), "Discovered buildable image directories");
    Ok(dirs)
}

/// ディレクトリを再帰的に走査
fn visit_dir(dir: &Path, dirs: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    // 正規化されたパスでシンボリックリンクのループを検出
    let canonical_dir = dir.canonicalize()?;
    if !visited.insert(canonical_dir.clone()) {
        warn!(dir = %canonical_dir.display(), "Symlink loop detected, skipping");
        return Ok(());
    }

    if dir.join(TEMPLATE_NAME).is_file() {
        dirs.push(dir.to_path_buf());
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            visit_dir(&path, dirs, visited)?;
        }
    }

    Ok(())
}

/// ディレクトリを再帰的にコピーする
///
/// ビルドコンテキストの作業ディレクトリへの複製に使う。
/// テンプレート自体 (`Dockerfile.j2`) はコピーしない。
pub fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let target = dest.join(entry.file_name());
        if path.is_dir() {
            copy_dir(&path, &target)?;
        } else if entry.file_name() != TEMPLATE_NAME {
            std::fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

/// レンダリング済み Dockerfile から親イメージ参照を取り出す
///
/// 最初の FROM 行の参照を返す。`--platform` などのフラグと
/// `AS` 別名は読み飛ばす。
pub fn parse_parent(dockerfile: &str) -> Option<String> {
    for line in dockerfile.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("FROM ") else {
            continue;
        };
        for token in rest.split_whitespace() {
            if token.starts_with("--") {
                continue;
            }
            return Some(token.to_string());
        }
    }
    None
}
