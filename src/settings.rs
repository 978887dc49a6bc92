use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::augment::{DataGeneratorConfig, GeneratorOptions};
use crate::dataset::DataRoot;
use crate::BowResult;

/// Environment variable naming a JSON settings file.
pub const SETTINGS_ENV: &str = "BOVW_SETTINGS";

/// Run configuration of the fine-tuning entry point.
///
/// Split paths are relative to `data_path`. Every field has a default, so a
/// settings file only needs the ones it changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub data_path: DataRoot,
    pub train_path: PathBuf,
    pub validation_path: PathBuf,
    pub test_path: PathBuf,
    pub results_dir: PathBuf,
    pub img_width: u32,
    pub img_height: u32,
    pub batch_size: usize,
    pub epochs: usize,
    pub classes: usize,
    pub steps_per_epoch: usize,
    pub validation_steps: usize,
    pub test_steps: usize,
    /// Name of a [`DataGeneratorConfig`] profile.
    pub profile: String,
    /// ONNX export of the pretrained network.
    pub model_path: PathBuf,
    /// Graph output holding the penultimate layer.
    pub penultimate_output: String,
    pub plot_history: bool,
    /// Seeds batch shuffling. Unseeded runs differ.
    pub seed: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        let batch_size = 32;
        Self {
            data_path: DataRoot::default(),
            train_path: "train".into(),
            validation_path: "test".into(),
            test_path: "test".into(),
            results_dir: "results/session4".into(),
            img_width: 224,
            img_height: 224,
            batch_size,
            epochs: 20,
            classes: 8,
            steps_per_epoch: 400 / batch_size + 1,
            validation_steps: 807,
            test_steps: 807,
            profile: "preprocess".into(),
            model_path: "models/vgg16.onnx".into(),
            penultimate_output: "fc2".into(),
            plot_history: false,
            seed: None,
        }
    }
}

impl Settings {
    /// Read settings from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> BowResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let settings = serde_json::from_str(&text)?;
        info!("Loaded settings from {:?}", path.as_ref());
        Ok(settings)
    }

    /// Settings from the file named by [`SETTINGS_ENV`], defaults when unset.
    pub fn from_env() -> BowResult<Self> {
        match std::env::var_os(SETTINGS_ENV) {
            Some(path) => Self::load(path),
            None => {
                debug!("{} not set, using default settings", SETTINGS_ENV);
                Ok(Self::default())
            }
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> BowResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn train_dir(&self) -> PathBuf {
        self.data_path.join(&self.train_path)
    }

    pub fn validation_dir(&self) -> PathBuf {
        self.data_path.join(&self.validation_path)
    }

    pub fn test_dir(&self) -> PathBuf {
        self.data_path.join(&self.test_path)
    }

    /// `(height, width)` of the network input.
    pub fn target_size(&self) -> (u32, u32) {
        (self.img_height, self.img_width)
    }

    pub fn generator_options(&self) -> BowResult<GeneratorOptions> {
        DataGeneratorConfig::by_name(&self.profile)
    }
}

/// Create the results directory and its parents. An existing directory is fine.
pub fn create_results_dir<P: AsRef<Path>>(dir: P) -> BowResult<()> {
    std::fs::create_dir_all(dir.as_ref())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::Preprocessing;
    use crate::BowErr;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.steps_per_epoch, 13);
        assert_eq!(s.target_size(), (224, 224));
        assert_eq!(s.validation_dir(), s.test_dir());
        assert_eq!(
            s.generator_options().unwrap().preprocessing,
            Preprocessing::Vgg16
        );
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"epochs": 2, "data_path": "/data/scenes", "seed": 9}"#).unwrap();
        let s = Settings::load(&path).unwrap();
        assert_eq!(s.epochs, 2);
        assert_eq!(s.seed, Some(9));
        assert_eq!(s.batch_size, 32);
        assert_eq!(s.train_dir(), PathBuf::from("/data/scenes/train"));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let s = Settings {
            profile: "transform".into(),
            ..Settings::default()
        };
        s.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), s);
    }

    #[test]
    fn bad_profile_and_bad_json() {
        let s = Settings {
            profile: "sharpen".into(),
            ..Settings::default()
        };
        assert!(matches!(s.generator_options(), Err(BowErr::UnknownProfile(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ epochs: ").unwrap();
        assert!(matches!(Settings::load(&path), Err(BowErr::Json(_))));
    }

    #[test]
    fn results_dir_may_exist() {
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("results").join("session4");
        create_results_dir(&results).unwrap();
        create_results_dir(&results).unwrap();
        assert!(results.is_dir());

        let file = dir.path().join("taken");
        std::fs::write(&file, b"").unwrap();
        assert!(create_results_dir(&file).is_err());
    }
}
