//! ビルドプロファイル
//!
//! プロファイル名をイメージ名の正規表現リストへ展開します。
//! 組み込みの定義に加えて、イメージディレクトリ直下の `profiles.json`
//! で上書き・追加できます。

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
pub struct Profiles {
    map: HashMap<String, Vec<String>>,
}

impl Profiles {
    /// 組み込みプロファイル
    pub fn builtin() -> Self {
        let mut map = HashMap::new();
        map.insert("default".to_string(), vec!["^base$".to_string()]);
        map.insert("all".to_string(), vec![".*".to_string()]);
        Self { map }
    }

    /// `profiles.json` があれば読み込んで組み込み定義にマージする
    ///
    /// 同名のプロファイルはファイル側が勝つ。
    pub fn load(images_dir: &Path) -> Result<Self> {
        let mut profiles = Self::builtin();
        let path = images_dir.join("profiles.json");
        if !path.exists() {
            return Ok(profiles);
        }

        let content = std::fs::read_to_string(&path)?;
        let user: HashMap<String, Vec<String>> =
            serde_json::from_str(&content).map_err(|e| CoreError::ProfileParse {
                path: path.clone(),
                message: e.to_string(),
            })?;
        debug!(path = %path.display(), count = user.len(), "Loaded profile definitions");
        profiles.map.extend(user);
        Ok(profiles)
    }

    /// プロファイル名を正規表現リストへ展開する
    pub fn expand(&self, names: &[String]) -> Result<Vec<String>> {
        let mut patterns = Vec::new();
        for name in names {
            let entries = self
                .map
                .get(name)
                .ok_or_else(|| CoreError::ProfileNotFound(name.clone()))?;
            patterns.extend(entries.iter().cloned());
        }
        Ok(patterns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_expand_builtin() {
        let profiles = Profiles::builtin();
        let patterns = profiles.expand(&["default".to_string()]).unwrap();
        assert_eq!(patterns, vec!["^base$".to_string()]);
    }

    #[test]
    fn test_expand_unknown_profile() {
        let profiles = Profiles::builtin();
        let result = profiles.expand(&["nonexistent".to_string()]);
        assert!(matches!(result, Err(CoreError::ProfileNotFound(_))));
    }

    #[test]
    fn test_load_merges_user_definitions() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(
            temp_dir.path().join("profiles.json"),
            r#"{"web": ["^nginx$", "^haproxy$"], "default": ["^core-"]}"#,
        )
        .unwrap();

        let profiles = Profiles::load(temp_dir.path()).unwrap();

        // 追加分
        let web = profiles.expand(&["web".to_string()]).unwrap();
        assert_eq!(web, vec!["^nginx$".to_string(), "^haproxy$".to_string()]);

        // 上書き分: ファイル側が勝つ
        let default = profiles.expand(&["default".to_string()]).unwrap();
        assert_eq!(default, vec!["^core-".to_string()]);
    }

    #[test]
    fn test_load_without_file_returns_builtin() {
        let temp_dir = tempfile::tempdir().unwrap();
        let profiles = Profiles::load(temp_dir.path()).unwrap();
        assert!(profiles.expand(&["all".to_string()]).is_ok());
    }
}
