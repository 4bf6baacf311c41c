//! ソース取得
//!
//! ソース記述子をイメージのビルドコンテキスト内の tar アーカイブとして
//! 実体化します。失敗は例外ではなく、対象イメージの状態を `Error` に
//! することで通知します。呼び出し側は戻り値と状態を確認してください。
//!
//! git / ディレクトリ由来のアーカイブは uid/gid を root に正規化します
//! （root 以外の所有者のままだと後段のパッケージインストールが壊れる）。
//! アーカイブの mtime はエポックに固定し、内容が変わらない限り
//! レイヤキャッシュが安定するようにします。

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{error, info};

use kasane_core::{Image, ImageStatus, SourceOrigin, SourceSpec};

use crate::error::{BuildError, Result};

/// HTTP取得のタイムアウト
const FETCH_TIMEOUT: Duration = Duration::from_secs(120);

/// ソース記述子をアーカイブとして実体化する
///
/// 成功時はアーカイブのパスを返す。失敗時はイメージの状態を
/// [`ImageStatus::Error`] にして `None` を返す。
pub async fn fetch(image: &Image, spec: &SourceSpec) -> Option<PathBuf> {
    let dest = image.path.join(format!("{}-archive.tar", spec.name));

    let result = match &spec.origin {
        SourceOrigin::Url => fetch_url(spec, &dest).await,
        SourceOrigin::Git { reference } => fetch_git(spec, reference, &dest).await,
        SourceOrigin::Local => fetch_local(spec, &dest),
    };

    match result {
        Ok(path) => Some(path),
        Err(e) => {
            error!(
                image = %image.name,
                source = %spec.name,
                "ソースの取得に失敗しました: {}",
                e
            );
            image.set_status(ImageStatus::Error);
            None
        }
    }
}

async fn fetch_url(spec: &SourceSpec, dest: &Path) -> Result<PathBuf> {
    info!(url = %spec.location, "Fetching source archive");

    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| BuildError::Fetch(e.to_string()))?;

    let response = client
        .get(&spec.location)
        .send()
        .await
        .map_err(|e| BuildError::Fetch(e.to_string()))?;

    if !response.status().is_success() {
        return Err(BuildError::Fetch(format!(
            "{} の取得に失敗しました (HTTP {})",
            spec.location,
            response.status()
        )));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| BuildError::Fetch(e.to_string()))?;
    let mut file = File::create(dest)?;
    file.write_all(&body)?;
    drop(file);

    set_epoch_mtime(dest)?;
    Ok(dest.to_path_buf())
}

async fn fetch_git(spec: &SourceSpec, reference: &str, dest: &Path) -> Result<PathBuf> {
    // アーカイブパスと参照から決定的なクローン先を導く
    let clone_dir = PathBuf::from(format!(
        "{}-{}",
        dest.display(),
        reference.replace('/', "-")
    ));

    let result = clone_and_archive(spec, reference, &clone_dir, dest).await;
    if result.is_err() {
        // 失敗したら中途半端なクローンを残さない
        let _ = std::fs::remove_dir_all(&clone_dir);
    }
    result
}

async fn clone_and_archive(
    spec: &SourceSpec,
    reference: &str,
    clone_dir: &Path,
    dest: &Path,
) -> Result<PathBuf> {
    info!(repo = %spec.location, reference, "Cloning source repository");

    run_git(&["clone", &spec.location, &clone_dir.to_string_lossy()]).await?;
    run_git(&[
        "-C",
        &clone_dir.to_string_lossy(),
        "checkout",
        reference,
    ])
    .await?;

    let sha = run_git(&["-C", &clone_dir.to_string_lossy(), "rev-parse", "HEAD"]).await?;
    info!(reference, commit = %sha.trim(), "Resolved source revision");

    tar_directory(clone_dir, dest)?;
    set_epoch_mtime(dest)?;
    Ok(dest.to_path_buf())
}

async fn run_git(args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .output()
        .await
        .map_err(|e| BuildError::Fetch(format!("gitの実行に失敗しました: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BuildError::Fetch(format!(
            "git {} 失敗:\n{}",
            args.join(" "),
            stderr
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn fetch_local(spec: &SourceSpec, dest: &Path) -> Result<PathBuf> {
    let source = Path::new(&spec.location);

    if source.is_dir() {
        tar_directory(source, dest)?;
    } else if source.is_file() {
        std::fs::copy(source, dest)?;
    } else {
        return Err(BuildError::Fetch(format!(
            "ローカルソースが見つかりません: {}",
            spec.location
        )));
    }

    set_epoch_mtime(dest)?;
    Ok(dest.to_path_buf())
}

/// ディレクトリを所有者正規化付きで tar アーカイブにする
fn tar_directory(dir: &Path, dest: &Path) -> Result<()> {
    let file = File::create(dest)?;
    let mut builder = tar::Builder::new(file);
    append_normalized(&mut builder, dir, Path::new(""))?;
    builder.finish()?;
    Ok(())
}

fn append_normalized<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    prefix: &Path,
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    // エントリ順を固定して再現性を保つ
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let rel = prefix.join(entry.file_name());

        if path.is_dir() {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            normalize_header(&mut header);
            builder.append_data(&mut header, &rel, std::io::empty())?;
            append_normalized(builder, &path, &rel)?;
        } else {
            let mut file = File::open(&path)?;
            let metadata = file.metadata()?;
            let mut header = tar::Header::new_gnu();
            header.set_size(metadata.len());
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                header.set_mode(metadata.permissions().mode() & 0o777);
            }
            #[cfg(not(unix))]
            header.set_mode(0o644);
            normalize_header(&mut header);
            builder.append_data(&mut header, &rel, &mut file)?;
        }
    }
    Ok(())
}

fn normalize_header(header: &mut tar::Header) {
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    let _ = header.set_username("root");
    let _ = header.set_groupname("root");
}

/// アーカイブの mtime をエポックに固定する
fn set_epoch_mtime(path: &Path) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(SystemTime::UNIX_EPOCH)
}
