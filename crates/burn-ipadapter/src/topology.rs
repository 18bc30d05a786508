//! Per-architecture key/value projection widths
//!
//! Each table lists the output width of every image key and value
//! projection, in checkpoint order: `[key_0, value_0, key_1, value_1, ...]`.
//! Entry pairs line up with the attention layers visited by the patch
//! installer, so a wrong width here conditions the wrong layer without any
//! runtime error.

use std::fmt;

/// Diffusion backbone family an adapter targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchitectureVariant {
    /// SD 1.x / 2.x UNet: 16 cross-attention layers, one per block
    Classic,
    /// SDXL UNet: 70 cross-attention layers, up to 10 per block
    ExtraLarge,
}

/// Image embedding width that selects [`ArchitectureVariant::ExtraLarge`]
///
/// This is a heuristic: an SDXL adapter driven by a 1024-wide encoder is
/// classified as Classic, so callers can override the variant.
pub const EXTRA_LARGE_EMBED_WIDTH: usize = 1280;

impl ArchitectureVariant {
    /// Infer the variant from the vision embedding width
    pub fn from_embedding_width(width: usize) -> Self {
        if width == EXTRA_LARGE_EMBED_WIDTH {
            Self::ExtraLarge
        } else {
            Self::Classic
        }
    }

    /// Key/value projection widths for this variant
    pub fn widths(self) -> &'static [usize] {
        widths(self)
    }

    /// Number of cross-attention layers patched for this variant
    pub fn num_layers(self) -> usize {
        widths(self).len() / 2
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Classic => "classic",
            Self::ExtraLarge => "extra-large",
        }
    }
}

impl fmt::Display for ArchitectureVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ArchitectureVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "classic" | "sd1x" | "sd15" => Ok(Self::Classic),
            "extra-large" | "extralarge" | "sdxl" | "xl" => Ok(Self::ExtraLarge),
            other => Err(format!("unknown architecture variant: {other}")),
        }
    }
}

/// Repeat `width` `count` times at position `offset` of `table`
const fn fill<const N: usize>(
    mut table: [usize; N],
    offset: usize,
    width: usize,
    count: usize,
) -> [usize; N] {
    let mut i = 0;
    while i < count {
        table[offset + i] = width;
        i += 1;
    }
    table
}

const CLASSIC_LEN: usize = 32;
const EXTRA_LARGE_LEN: usize = 140;

// input 1,2 | input 4,5 | input 7,8 + output 3,4,5 | output 6,7,8 | output 9,10,11 | middle
const CLASSIC_WIDTHS: [usize; CLASSIC_LEN] = {
    let t = [0; CLASSIC_LEN];
    let t = fill(t, 0, 320, 4);
    let t = fill(t, 4, 640, 4);
    let t = fill(t, 8, 1280, 10);
    let t = fill(t, 18, 640, 6);
    let t = fill(t, 24, 320, 6);
    fill(t, 30, 1280, 2)
};

// input 4,5 | input 7,8 | output 0,1,2 | output 3,4,5 | middle
const EXTRA_LARGE_WIDTHS: [usize; EXTRA_LARGE_LEN] = {
    let t = [0; EXTRA_LARGE_LEN];
    let t = fill(t, 0, 640, 8);
    let t = fill(t, 8, 1280, 40);
    let t = fill(t, 48, 1280, 60);
    let t = fill(t, 108, 640, 12);
    fill(t, 120, 1280, 20)
};

/// Ordered key/value projection widths for `variant`
pub fn widths(variant: ArchitectureVariant) -> &'static [usize] {
    match variant {
        ArchitectureVariant::Classic => &CLASSIC_WIDTHS,
        ArchitectureVariant::ExtraLarge => &EXTRA_LARGE_WIDTHS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand(runs: &[(usize, usize)]) -> Vec<usize> {
        runs.iter()
            .flat_map(|&(width, count)| std::iter::repeat_n(width, count))
            .collect()
    }

    #[test]
    fn test_classic_table() {
        let table = widths(ArchitectureVariant::Classic);
        assert_eq!(table.len(), 32);
        assert_eq!(ArchitectureVariant::Classic.num_layers(), 16);
        assert_eq!(
            table,
            expand(&[(320, 4), (640, 4), (1280, 10), (640, 6), (320, 6), (1280, 2)]).as_slice()
        );
    }

    #[test]
    fn test_extra_large_table() {
        let table = widths(ArchitectureVariant::ExtraLarge);
        assert_eq!(table.len(), 140);
        assert_eq!(ArchitectureVariant::ExtraLarge.num_layers(), 70);
        assert_eq!(
            table,
            expand(&[(640, 8), (1280, 40), (1280, 60), (640, 12), (1280, 20)]).as_slice()
        );
    }

    #[test]
    fn test_tables_pair_up() {
        for variant in [ArchitectureVariant::Classic, ArchitectureVariant::ExtraLarge] {
            let table = variant.widths();
            assert_eq!(table.len() % 2, 0);
            for pair in table.chunks_exact(2) {
                assert_eq!(pair[0], pair[1], "key and value widths differ");
            }
        }
    }

    #[test]
    fn test_variant_from_width() {
        assert_eq!(
            ArchitectureVariant::from_embedding_width(1280),
            ArchitectureVariant::ExtraLarge
        );
        assert_eq!(
            ArchitectureVariant::from_embedding_width(1024),
            ArchitectureVariant::Classic
        );
        assert_eq!(
            ArchitectureVariant::from_embedding_width(768),
            ArchitectureVariant::Classic
        );
    }

    #[test]
    fn test_variant_parse() {
        assert_eq!("sdxl".parse(), Ok(ArchitectureVariant::ExtraLarge));
        assert_eq!("Classic".parse(), Ok(ArchitectureVariant::Classic));
        assert!("flux".parse::<ArchitectureVariant>().is_err());
    }
}
