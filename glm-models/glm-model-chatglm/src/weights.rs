use glm_core::{Backend, Result, StateDict};

/// Names and shapes a model needs from a state dict.
#[derive(Debug, Clone, Default)]
pub struct WeightSpecs {
    specs: Vec<(String, Vec<usize>)>,
}

impl WeightSpecs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, shape: &[usize]) {
        self.specs.push((name.into(), shape.to_vec()));
    }

    /// `{prefix}.weight` as `[out, inp]`, plus `{prefix}.bias` when `bias`.
    pub(crate) fn linear(&mut self, prefix: &str, out: usize, inp: usize, bias: bool) {
        self.push(format!("{prefix}.weight"), &[out, inp]);
        if bias {
            self.push(format!("{prefix}.bias"), &[out]);
        }
    }

    pub(crate) fn rms_norm(&mut self, prefix: &str, dim: usize) {
        self.push(format!("{prefix}.weight"), &[dim]);
    }

    pub(crate) fn layer_norm(&mut self, prefix: &str, dim: usize) {
        self.push(format!("{prefix}.weight"), &[dim]);
        self.push(format!("{prefix}.bias"), &[dim]);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[usize])> {
        self.specs.iter().map(|(n, s)| (n.as_str(), s.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Check every entry is present with the listed shape.
    pub fn validate(&self, state_dict: &StateDict) -> Result<()> {
        for (name, shape) in self.iter() {
            state_dict.expect(name, shape)?;
        }
        Ok(())
    }
}

/// Uploads named tensors from a state dict onto a backend.
///
/// HuggingFace stores linear weights as `[out_features, in_features]`.
/// Our `matmul(x, W)` needs `[in_features, out_features]`, so `linear`
/// transposes at bind time.
pub(crate) struct WeightBinder<'a, B: Backend> {
    state_dict: &'a StateDict,
    backend: &'a B,
}

impl<'a, B: Backend> WeightBinder<'a, B> {
    pub(crate) fn new(state_dict: &'a StateDict, backend: &'a B) -> Self {
        Self {
            state_dict,
            backend,
        }
    }

    pub(crate) fn tensor(&self, name: &str, shape: &[usize]) -> Result<B::Tensor> {
        let data = self.state_dict.expect(name, shape)?;
        self.backend.upload(data)
    }

    /// Bind a tensor stored with extra leading unit dims as `shape`.
    pub(crate) fn tensor_as(
        &self,
        name: &str,
        stored: &[usize],
        shape: &[usize],
    ) -> Result<B::Tensor> {
        let t = self.tensor(name, stored)?;
        self.backend.reshape(&t, shape)
    }

    /// Load and transpose a linear weight: [out, in] -> [in, out].
    pub(crate) fn linear_weight(&self, name: &str, out: usize, inp: usize) -> Result<B::Tensor> {
        let raw = self.tensor(name, &[out, inp])?;
        self.backend.transpose(&raw, 0, 1)
    }

    /// Load a convolution kernel `[out, in, k, k]` as an im2col matrix
    /// `[in * k * k, out]`.
    pub(crate) fn conv_weight(
        &self,
        name: &str,
        out: usize,
        inp: usize,
        kernel: usize,
    ) -> Result<B::Tensor> {
        let raw = self.tensor(name, &[out, inp, kernel, kernel])?;
        let flat = self.backend.reshape(&raw, &[out, inp * kernel * kernel])?;
        self.backend.transpose(&flat, 0, 1)
    }

    pub(crate) fn backend(&self) -> &B {
        self.backend
    }
}
