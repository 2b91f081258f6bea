//! FLUX transformer layers that a LoRA can target

use crate::error::{Result, TrainError};
use once_cell::sync::Lazy;
use regex::Regex;

const DOUBLE_BLOCKS: usize = 19;
const SINGLE_BLOCKS: usize = 38;

const DOUBLE_BLOCK_LAYERS: &[&str] = &[
    "norm1.linear",
    "norm1_context.linear",
    "attn.to_q",
    "attn.to_k",
    "attn.to_v",
    "attn.add_q_proj",
    "attn.add_k_proj",
    "attn.add_v_proj",
    "attn.to_out.0",
    "attn.to_add_out",
    "ff.net.0.proj",
    "ff.net.2",
    "ff_context.net.0.proj",
    "ff_context.net.2",
];

const SINGLE_BLOCK_LAYERS: &[&str] = &[
    "norm.linear",
    "proj_mlp",
    "proj_out",
    "attn.to_q",
    "attn.to_k",
    "attn.to_v",
];

static AVAILABLE_LAYERS: Lazy<Vec<String>> = Lazy::new(|| {
    let mut layers = Vec::new();
    for block in 0..DOUBLE_BLOCKS {
        for layer in DOUBLE_BLOCK_LAYERS {
            layers.push(format!("transformer.transformer_blocks.{}.{}", block, layer));
        }
    }
    for block in 0..SINGLE_BLOCKS {
        for layer in SINGLE_BLOCK_LAYERS {
            layers.push(format!("transformer.single_transformer_blocks.{}.{}", block, layer));
        }
    }
    layers
});

/// Every linear layer name in diffusers naming
pub fn available_layers_to_optimize() -> &'static [String] {
    &AVAILABLE_LAYERS
}

/// Layers whose name contains a match for `pattern`
pub fn match_layers_to_optimize(pattern: &str) -> Result<Vec<String>> {
    let regex = Regex::new(pattern)
        .map_err(|e| TrainError::invalid(format!("Invalid layer regex '{}': {}", pattern, e)))?;

    let matched: Vec<String> = available_layers_to_optimize()
        .iter()
        .filter(|layer| regex.is_match(layer))
        .cloned()
        .collect();

    if matched.is_empty() {
        return Err(TrainError::invalid(format!(
            "The regex '{}' didn't match any layers. These layers can be optimized:\n{}",
            pattern,
            available_layers_to_optimize().join("\n")
        )));
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_layer_inventory() {
        let layers = available_layers_to_optimize();
        assert_eq!(layers.len(), 19 * 14 + 38 * 6);
        assert!(layers.contains(&"transformer.single_transformer_blocks.37.proj_out".to_string()));
        assert!(layers.contains(&"transformer.transformer_blocks.18.attn.to_add_out".to_string()));
    }

    #[test]
    fn test_match_selected_blocks() {
        let matched =
            match_layers_to_optimize("transformer.single_transformer_blocks.(7|12|16|20).proj_out")
                .unwrap();
        assert_eq!(
            matched,
            vec![
                "transformer.single_transformer_blocks.7.proj_out",
                "transformer.single_transformer_blocks.12.proj_out",
                "transformer.single_transformer_blocks.16.proj_out",
                "transformer.single_transformer_blocks.20.proj_out",
            ]
        );
    }

    #[test]
    fn test_no_match_lists_layers() {
        let err = match_layers_to_optimize("vae.decoder").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("didn't match any layers"));
        assert!(err.to_string().contains("transformer.transformer_blocks.0.attn.to_q"));
    }

    #[test]
    fn test_bad_regex() {
        let err = match_layers_to_optimize("blocks.(7").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
