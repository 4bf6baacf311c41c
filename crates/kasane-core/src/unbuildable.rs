//! ビルド不能イメージの静的テーブル
//!
//! ディストリビューション・インストール方式・アーキテクチャの組み合わせで
//! ビルドできないことが分かっているイメージを列挙します。キーは
//! `+` で連結したタグの組で、キーに含まれる全タグが現在の設定に一致した
//! ときだけそのエントリが適用されます。

use std::collections::HashSet;

use crate::config::BuildConfig;

/// タグの組み合わせ → ビルド不能なイメージ名
///
/// タグは {base, install_type, base_arch} のいずれかに一致すればよい。
const UNBUILDABLE: &[(&str, &[&str])] = &[
    ("debian", &["sysprobe"]),
    ("aarch64", &["sysprobe", "flamegraph-agent"]),
    ("binary", &["toolchain-devel"]),
    ("debian+source", &["legacy-runtime"]),
    ("ubuntu+binary+aarch64", &["tracing-sidecar"]),
];

/// 現在の設定でビルド不能なイメージ名の集合を返す
pub fn unbuildable_images(conf: &BuildConfig) -> HashSet<String> {
    let tags = [
        conf.base.as_str(),
        conf.install_type.as_str(),
        conf.base_arch.as_str(),
    ];
    unbuildable_from(UNBUILDABLE, &tags)
}

/// テーブルと現在のタグ集合からビルド不能集合を計算する
pub fn unbuildable_from(table: &[(&str, &[&str])], tags: &[&str]) -> HashSet<String> {
    let mut result = HashSet::new();
    for (key, images) in table {
        let applies = key.split('+').all(|component| tags.contains(&component));
        if applies {
            result.extend(images.iter().map(|name| name.to_string()));
        }
    }
    result
}
