//! Run configuration loaded from TOML, with defaults for every field.
//!
//! ```toml
//! [train]
//! epochs = 20
//! learning_rate = 0.005
//!
//! [data]
//! dir = "data/cifar-10-batches-bin"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::alexnet::AlexNetConfig;
use crate::error::{Error, Result};
use crate::tensor::Precision;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainSection {
    pub epochs: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for TrainSection {
    fn default() -> Self {
        Self {
            epochs: 20,
            learning_rate: 0.005,
            momentum: 0.9,
            weight_decay: 0.005,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelSection {
    pub num_classes: usize,
    pub dropout: f64,
    /// Seeds weight initialisation and the dropout masks.
    pub seed: u64,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            num_classes: 10,
            dropout: 0.5,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataSection {
    /// Directory holding the CIFAR-10 `.bin` batch files.
    pub dir: PathBuf,
    pub batch_size: usize,
    /// Share of the training files held out for validation.
    pub valid_ratio: f64,
    /// Seeds the train/validation split and the per-epoch shuffle.
    pub seed: u64,
    pub image_size: usize,
    /// Random horizontal flips on training batches.
    pub augment: bool,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/cifar-10-batches-bin"),
            batch_size: 64,
            valid_ratio: 0.1,
            seed: 42,
            image_size: 227,
            augment: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    pub train: TrainSection,
    pub model: ModelSection,
    pub data: DataSection,
}

impl TrainConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(&path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));
        let (train, model, data) = (&self.train, &self.model, &self.data);

        if train.epochs == 0 {
            return fail("train.epochs must be at least 1".into());
        }
        if !(train.learning_rate > 0.0) {
            return fail(format!("train.learning_rate must be positive, got {}", train.learning_rate));
        }
        if !(train.momentum >= 0.0) || !(train.weight_decay >= 0.0) {
            return fail("train.momentum and train.weight_decay must be non-negative".into());
        }
        if model.num_classes == 0 {
            return fail("model.num_classes must be at least 1".into());
        }
        if !(0.0..1.0).contains(&model.dropout) {
            return fail(format!("model.dropout must be in [0, 1), got {}", model.dropout));
        }
        if data.batch_size == 0 {
            return fail("data.batch_size must be at least 1".into());
        }
        if !(0.0..1.0).contains(&data.valid_ratio) {
            return fail(format!("data.valid_ratio must be in [0, 1), got {}", data.valid_ratio));
        }
        if data.image_size == 0 {
            return fail("data.image_size must be at least 1".into());
        }
        Ok(())
    }

    pub fn alexnet(&self) -> AlexNetConfig {
        AlexNetConfig {
            num_classes: self.model.num_classes,
            dropout: self.model.dropout as Precision,
            seed: self.model.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_gives_defaults() {
        let config = TrainConfig::from_toml_str("").unwrap();
        assert_eq!(config, TrainConfig::default());
        assert_eq!(config.train.epochs, 20);
        assert_eq!(config.data.batch_size, 64);
        assert_eq!(config.alexnet(), AlexNetConfig::default());
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = TrainConfig::from_toml_str(
            "[train]\nepochs = 3\n\n[data]\nbatch_size = 16\naugment = true\n",
        )
        .unwrap();
        assert_eq!(config.train.epochs, 3);
        assert_eq!(config.train.momentum, 0.9);
        assert_eq!(config.data.batch_size, 16);
        assert!(config.data.augment);
        assert_eq!(config.data.valid_ratio, 0.1);
    }

    #[test]
    fn invalid_values_are_rejected() {
        for doc in [
            "[train]\nepochs = 0",
            "[train]\nlearning_rate = 0.0",
            "[model]\ndropout = 1.0",
            "[data]\nvalid_ratio = 1.0",
            "[data]\nbatch_size = 0",
            "[data]\nunknown = 1",
        ] {
            assert!(
                matches!(TrainConfig::from_toml_str(doc), Err(Error::Config(_))),
                "accepted {doc:?}"
            );
        }
    }

    #[test]
    fn loads_from_file_and_round_trips() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[model]\nseed = 7\n[data]\ndir = \"/tmp/cifar\"").unwrap();
        let config = TrainConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.model.seed, 7);
        assert_eq!(config.data.dir, PathBuf::from("/tmp/cifar"));

        let text = config.to_toml_string().unwrap();
        assert_eq!(TrainConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            TrainConfig::load_from_file(dir.path().join("absent.toml")),
            Err(Error::Io(_))
        ));
    }
}
