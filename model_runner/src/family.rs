use std::fmt;

/// Model identifiers that are loaded as encoder-decoder models.
pub const SEQ2SEQ_MODELS: &[&str] = &["bigscience/T0_3B", "bigscience/T0"];

/// Which architecture family a checkpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Seq2Seq,
    Causal,
}

impl ModelFamily {
    /// Picks the family from the identifier the user passed, not from the resolved path.
    pub fn for_model(model_name_or_path: &str) -> Self {
        if SEQ2SEQ_MODELS.contains(&model_name_or_path) {
            ModelFamily::Seq2Seq
        } else {
            ModelFamily::Causal
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFamily::Seq2Seq => write!(f, "seq2seq"),
            ModelFamily::Causal => write!(f, "causal"),
        }
    }
}
