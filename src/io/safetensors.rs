use anyhow::{Context, Result, anyhow};
use candle_core::Tensor;
use candle_nn::VarMap;
use chrono::Local;
use safetensors::{SafeTensors, serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::config::Architecture;
use crate::model::ModelDims;

/// Architecture and shape information stored alongside the weights
#[derive(Debug, Clone, PartialEq)]
pub struct WeightMetadata {
    pub architecture: Architecture,
    pub dims: ModelDims,
    pub created: String,
}

impl WeightMetadata {
    pub fn new(architecture: Architecture, dims: ModelDims) -> Self {
        Self {
            architecture,
            dims,
            created: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("architecture".to_string(), self.architecture.to_string()),
            ("num_features".to_string(), self.dims.num_features.to_string()),
            ("max_sequence_length".to_string(), self.dims.max_sequence_length.to_string()),
            ("embedding_dim".to_string(), self.dims.embedding_dim.to_string()),
            ("created".to_string(), self.created.clone()),
        ])
    }

    fn from_map(metadata: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| anyhow!("Missing {} in metadata", key))
        };
        let parse = |key: &str| -> Result<usize> {
            get(key)?
                .parse::<usize>()
                .with_context(|| format!("Failed to parse {} as usize", key))
        };

        Ok(Self {
            architecture: get("architecture")?.parse()?,
            dims: ModelDims {
                num_features: parse("num_features")?,
                max_sequence_length: parse("max_sequence_length")?,
                embedding_dim: parse("embedding_dim")?,
            },
            created: metadata.get("created").cloned().unwrap_or_default(),
        })
    }
}

/// Save every variable of `varmap` in safetensors format with `metadata`
pub fn save_weights<P: AsRef<Path>>(varmap: &VarMap, path: P, metadata: &WeightMetadata) -> Result<()> {
    let path = path.as_ref();

    let tensors: HashMap<String, Tensor> = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("VarMap lock poisoned"))?;
        data.iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    };

    let data = serialize(tensors, &Some(metadata.to_map()))
        .context("Failed to serialize model tensors to safetensors format")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)
        .with_context(|| format!("Failed to write model file: {}", path.display()))?;

    log::info!("Model saved to: {}", path.display());
    Ok(())
}

/// Read only the metadata header of a weight file
pub fn read_metadata<P: AsRef<Path>>(path: P) -> Result<WeightMetadata> {
    let path = path.as_ref();
    let data = fs::read(path)
        .with_context(|| format!("Failed to read model file: {}", path.display()))?;
    let (_, header) = SafeTensors::read_metadata(&data)
        .context("Failed to deserialize safetensors header")?;
    let metadata = header
        .metadata()
        .as_ref()
        .ok_or_else(|| anyhow!("{} carries no metadata", path.display()))?;
    WeightMetadata::from_map(metadata)
}

/// Overwrite the variables of an already built model with the stored weights
pub fn load_weights<P: AsRef<Path>>(varmap: &mut VarMap, path: P) -> Result<()> {
    let path = path.as_ref();
    varmap
        .load(path)
        .with_context(|| format!("Failed to load weights from {}", path.display()))?;
    log::info!("Model loaded from: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    #[test]
    fn test_weights_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("CNN_model.safetensors");
        let dims = ModelDims {
            num_features: 12,
            max_sequence_length: 6,
            embedding_dim: 3,
        };
        let ids = Tensor::new(&[[0u32, 1, 2, 3, 4, 5]], &Device::Cpu).unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let original = model::build(Architecture::Cnn, &dims, vb).unwrap();
        let expected: Vec<f32> = original.predict_proba(&ids).unwrap().to_vec1().unwrap();
        save_weights(&varmap, &path, &WeightMetadata::new(Architecture::Cnn, dims)).unwrap();

        let meta = read_metadata(&path).unwrap();
        assert_eq!(meta.architecture, Architecture::Cnn);
        assert_eq!(meta.dims, dims);

        let mut restored_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&restored_map, DType::F32, &Device::Cpu);
        let restored = model::build(meta.architecture, &meta.dims, vb).unwrap();
        load_weights(&mut restored_map, &path).unwrap();
        let actual: Vec<f32> = restored.predict_proba(&ids).unwrap().to_vec1().unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_missing_metadata_key() {
        let map = HashMap::from([("architecture".to_string(), "LSTM".to_string())]);
        let err = WeightMetadata::from_map(&map).unwrap_err();
        assert!(err.to_string().contains("num_features"));
    }
}
