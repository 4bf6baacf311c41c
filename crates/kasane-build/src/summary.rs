//! ビルド結果のサマリ
//!
//! 最終的なイメージ状態を6つのバケットに分類し、人間向けの表示と
//! 機械可読な JSON の両方を提供します。

use colored::Colorize;
use serde::Serialize;

use kasane_core::{ImageGraph, ImageStatus};

/// 失敗したイメージの記録
#[derive(Debug, Clone, Serialize)]
pub struct FailedImage {
    pub name: String,
    pub status: ImageStatus,
}

/// 状態ごとのイメージ名のバケット
#[derive(Debug, Default, Serialize)]
pub struct Summary {
    pub built: Vec<String>,
    pub failed: Vec<FailedImage>,
    pub allowed_to_fail: Vec<FailedImage>,
    pub unmatched: Vec<String>,
    pub skipped: Vec<String>,
    pub unbuildable: Vec<String>,
}

impl Summary {
    /// グラフの最終状態を分類する
    ///
    /// 許容リストに載ったイメージの失敗は全体の失敗とは数えない。
    /// 終端状態に至らなかったイメージ（親の失敗で走らなかった等）も
    /// 失敗側に入れて隠さず報告する。
    pub fn from_graph(graph: &ImageGraph, allowed_to_fail: &[String]) -> Self {
        let mut summary = Summary::default();

        for image in graph.iter() {
            let name = image.name.clone();
            match image.status() {
                ImageStatus::Built => summary.built.push(name),
                ImageStatus::Unmatched => summary.unmatched.push(name),
                ImageStatus::Skipped => summary.skipped.push(name),
                ImageStatus::Unbuildable => summary.unbuildable.push(name),
                status => {
                    let entry = FailedImage { name, status };
                    if allowed_to_fail.contains(&entry.name) {
                        summary.allowed_to_fail.push(entry);
                    } else {
                        summary.failed.push(entry);
                    }
                }
            }
        }
        summary
    }

    /// 全体として失敗扱いにすべきか
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// 人間向けのサマリを表示する
    pub fn print(&self) {
        println!();
        println!("{}", "=== ビルド結果 ===".bold());

        if !self.built.is_empty() {
            println!("{}", format!("ビルド成功 ({})", self.built.len()).green());
            for name in &self.built {
                println!("  {} {}", "✓".green(), name);
            }
        }

        if !self.failed.is_empty() {
            println!("{}", format!("ビルド失敗 ({})", self.failed.len()).red());
            for entry in &self.failed {
                println!("  {} {} ({})", "✗".red(), entry.name, entry.status);
            }
        }

        if !self.allowed_to_fail.is_empty() {
            println!(
                "{}",
                format!("失敗許容 ({})", self.allowed_to_fail.len()).yellow()
            );
            for entry in &self.allowed_to_fail {
                println!("  {} {} ({})", "-".yellow(), entry.name, entry.status);
            }
        }

        if !self.skipped.is_empty() {
            println!("スキップ ({})", self.skipped.len());
            for name in &self.skipped {
                println!("  - {}", name);
            }
        }

        if !self.unbuildable.is_empty() {
            println!("ビルド不能 ({})", self.unbuildable.len());
            for name in &self.unbuildable {
                println!("  - {}", name);
            }
        }

        if !self.unmatched.is_empty() {
            println!("対象外 ({})", self.unmatched.len());
        }
    }
}
