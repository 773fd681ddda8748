use std::collections::HashMap;
use std::path::{Path, PathBuf};

use glm_core::{DType, GlmError, Result, StateDict, TensorData};
use memmap2::Mmap;
use safetensors::SafeTensors;
use tracing::{debug, info};

/// Memory-maps every `.safetensors` shard in a model directory.
pub struct SafeTensorsLoader {
    files: Vec<PathBuf>,
    mmaps: Vec<Mmap>,
    /// Maps tensor name -> mmap index for O(1) lookup.
    tensor_index: HashMap<String, usize>,
}

impl SafeTensorsLoader {
    pub fn new(model_dir: &Path) -> Result<Self> {
        let mut files: Vec<_> = std::fs::read_dir(model_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(GlmError::ModelLoad(format!(
                "no .safetensors files found in {}",
                model_dir.display()
            )));
        }
        Self::from_files(files)
    }

    pub fn from_files(files: Vec<PathBuf>) -> Result<Self> {
        let mmaps = files
            .iter()
            .map(|path| {
                let file = std::fs::File::open(path)?;
                // SAFETY: the mapping is read-only and dropped with the loader.
                Ok(unsafe { Mmap::map(&file) }?)
            })
            .collect::<std::result::Result<Vec<_>, std::io::Error>>()?;

        let mut tensor_index = HashMap::new();
        for (idx, mmap) in mmaps.iter().enumerate() {
            let tensors = SafeTensors::deserialize(mmap)
                .map_err(|e| GlmError::ModelLoad(format!("{}: {e}", files[idx].display())))?;
            for name in tensors.names() {
                tensor_index.insert(name.to_string(), idx);
            }
        }
        debug!(
            files = files.len(),
            tensors = tensor_index.len(),
            "indexed safetensors shards"
        );

        Ok(Self {
            files,
            mmaps,
            tensor_index,
        })
    }

    /// Load a specific tensor by name.
    pub fn load_tensor(&self, name: &str) -> Result<TensorData> {
        let idx = self
            .tensor_index
            .get(name)
            .ok_or_else(|| GlmError::MissingWeight(name.to_string()))?;
        let tensors = SafeTensors::deserialize(&self.mmaps[*idx])
            .map_err(|e| GlmError::ModelLoad(e.to_string()))?;
        let view = tensors
            .tensor(name)
            .map_err(|e| GlmError::ModelLoad(e.to_string()))?;
        view_to_tensor_data(name, &view)
    }

    /// Copy every tensor out of the mapped shards.
    pub fn load_state_dict(&self) -> Result<StateDict> {
        let mut state_dict = StateDict::new();
        for (path, mmap) in self.files.iter().zip(&self.mmaps) {
            let tensors = SafeTensors::deserialize(mmap)
                .map_err(|e| GlmError::ModelLoad(format!("{}: {e}", path.display())))?;
            for (name, view) in tensors.tensors() {
                let data = view_to_tensor_data(&name, &view)?;
                state_dict.insert(name, data);
            }
        }
        info!(tensors = state_dict.len(), "loaded state dict");
        Ok(state_dict)
    }

    /// List all tensor names across all files.
    pub fn tensor_names(&self) -> Vec<String> {
        self.tensor_index.keys().cloned().collect()
    }
}

fn view_to_tensor_data(name: &str, view: &safetensors::tensor::TensorView<'_>) -> Result<TensorData> {
    let shape = view.shape().to_vec();
    let data = view.data();
    match view.dtype() {
        safetensors::Dtype::F32 => TensorData::new(shape, DType::F32, data.to_vec()),
        safetensors::Dtype::F16 => TensorData::new(shape, DType::F16, data.to_vec()),
        safetensors::Dtype::BF16 => TensorData::new(shape, DType::BF16, data.to_vec()),
        other => Err(GlmError::UnsupportedFormat(format!(
            "tensor {name} has unsupported dtype {other:?}"
        ))),
    }
}
