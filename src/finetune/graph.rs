use std::fmt::Write as _;
use std::path::Path;

use log::info;

use super::backbone::LayerSummary;
use crate::BowResult;

fn shape(layer: &LayerSummary) -> String {
    let dims: Vec<String> = layer.output_shape.iter().map(|d| d.to_string()).collect();
    format!("(None, {})", dims.join(", "))
}

/// Graphviz description of a sequential network, one node per layer with
/// its name, kind and output shape.
pub fn to_dot(name: &str, layers: &[LayerSummary]) -> String {
    let mut dot = String::new();
    let _ = writeln!(dot, "digraph {:?} {{", name);
    let _ = writeln!(dot, "  node [shape=record];");
    for (i, layer) in layers.iter().enumerate() {
        let _ = writeln!(
            dot,
            "  l{} [label=\"{}: {:?} | output: {}\"];",
            i,
            layer.name,
            layer.kind,
            shape(layer)
        );
    }
    for i in 1..layers.len() {
        let _ = writeln!(dot, "  l{} -> l{};", i - 1, i);
    }
    dot.push_str("}\n");
    dot
}

/// Render the network diagram to `path`.
pub fn plot_model<P: AsRef<Path>>(name: &str, layers: &[LayerSummary], path: P) -> BowResult<()> {
    std::fs::write(path.as_ref(), to_dot(name, layers))?;
    info!("Wrote model diagram to {:?}", path.as_ref());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finetune::backbone::LayerKind;

    #[test]
    fn chain_of_layers() {
        let layers = vec![
            LayerSummary::new("input_1", LayerKind::InputLayer, &[4, 4, 3]),
            LayerSummary::new("predictions", LayerKind::Dense, &[8]),
        ];
        let dot = to_dot("model", &layers);
        assert!(dot.starts_with("digraph \"model\" {"));
        assert!(dot.contains("predictions: Dense | output: (None, 8)"));
        assert!(dot.contains("l0 -> l1;"));
    }
}
