//! 依存グラフの Graphviz DOT 出力

use crate::graph::ImageGraph;
use crate::image::ImageStatus;

/// マッチしたイメージの依存グラフを DOT 形式で書き出す
///
/// エッジは `parent -> child`。親がグラフ外（外部ベース）のイメージは
/// ノードのみ出力する。
pub fn render_dot(graph: &ImageGraph) -> String {
    let mut out = String::from("digraph images {\n");

    for image in graph.iter() {
        if !included(image.status()) {
            continue;
        }
        out.push_str(&format!("  \"{}\";\n", image.name));
        for &child in &image.children {
            let child_image = graph.get(child);
            if included(child_image.status()) {
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", image.name, child_image.name));
            }
        }
    }

    out.push_str("}\n");
    out
}

fn included(status: ImageStatus) -> bool {
    !matches!(status, ImageStatus::Unmatched | ImageStatus::Unbuildable)
}
