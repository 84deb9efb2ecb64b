use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::error::DatasetError;

/// One partition of the caption corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    /// Packing order. Caption resampling draws from a single generator in this order.
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    /// Map a caption-source provenance label onto a split. Unknown labels exclude the image.
    pub fn from_provenance(label: &str) -> Option<Self> {
        match label {
            "train" | "restval" => Some(Split::Train),
            "val" => Some(Split::Val),
            "test" => Some(Split::Test),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Split::Train => "TRAIN",
            Split::Val => "VAL",
            Split::Test => "TEST",
        }
    }

    pub fn images_file(self, dir: &Path) -> PathBuf {
        dir.join(format!("{}_IMAGES.bin", self.as_str()))
    }

    pub fn captions_file(self, dir: &Path) -> PathBuf {
        dir.join(format!("{}_CAPTIONS.json", self.as_str()))
    }

    pub fn lengths_file(self, dir: &Path) -> PathBuf {
        dir.join(format!("{}_CAPLENS.json", self.as_str()))
    }
}

impl FromStr for Split {
    type Err = DatasetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "TRAIN" => Ok(Split::Train),
            "VAL" => Ok(Split::Val),
            "TEST" => Ok(Split::Test),
            _ => Err(DatasetError::UnknownSplit(value.to_string())),
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("train".parse::<Split>().unwrap(), Split::Train);
        assert_eq!("Val".parse::<Split>().unwrap(), Split::Val);
        assert_eq!("TEST".parse::<Split>().unwrap(), Split::Test);
        assert!(matches!(
            "validation".parse::<Split>(),
            Err(DatasetError::UnknownSplit(name)) if name == "validation"
        ));
    }

    #[test]
    fn restval_counts_as_train() {
        assert_eq!(Split::from_provenance("restval"), Some(Split::Train));
        assert_eq!(Split::from_provenance("extra"), None);
    }
}
