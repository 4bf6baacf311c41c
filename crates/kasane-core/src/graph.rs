//! イメージグラフ（アリーナ）
//!
//! 発見した全イメージをインデックス付きで保持し、Dockerfile の FROM 参照を
//! インデックスのリンクに解決します。名前→インデックスの対応は構築時に
//! 一度だけ作り、以後の改名はリンクに影響しません。

use std::collections::HashMap;

use tracing::debug;

use crate::image::Image;

#[derive(Debug, Default)]
pub struct ImageGraph {
    images: Vec<Image>,
    index: HashMap<String, usize>,
}

impl ImageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// イメージを登録してインデックスを返す
    pub fn insert(&mut self, image: Image) -> usize {
        let idx = self.images.len();
        self.index.insert(image.name.clone(), idx);
        self.images.push(image);
        idx
    }

    /// FROM 参照を解決して親子リンクを張る
    ///
    /// 親参照はレンダリング済み Dockerfile の完全修飾名なので、
    /// canonical name の一致で解決する。どのイメージにも一致しない
    /// 参照は外部ベースイメージ（ルート）として扱う。
    pub fn link(&mut self) {
        let canonical: HashMap<String, usize> = self
            .images
            .iter()
            .enumerate()
            .map(|(idx, image)| (image.canonical_name(), idx))
            .collect();

        for idx in 0..self.images.len() {
            let Some(parent_ref) = self.images[idx].parent_name.clone() else {
                continue;
            };
            match canonical.get(&parent_ref) {
                Some(&parent) => {
                    self.images[idx].parent = Some(parent);
                    self.images[parent].children.push(idx);
                }
                None => {
                    debug!(
                        image = %self.images[idx].name,
                        parent = %parent_ref,
                        "Parent reference is an external base image"
                    );
                }
            }
        }
    }

    pub fn get(&self, idx: usize) -> &Image {
        &self.images[idx]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&Image> {
        self.index_of(name).map(|idx| self.get(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Image> {
        self.images.iter()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// 親から順にルートまでの先祖インデックスを返す
    pub fn ancestors(&self, idx: usize) -> Vec<usize> {
        let mut result = Vec::new();
        let mut current = self.images[idx].parent;
        while let Some(parent) = current {
            result.push(parent);
            current = self.images[parent].parent;
        }
        result
    }
}
