//! Parameter store for a worker's live model.
//!
//! Received tensors are applied here after every rank has passed the
//! post-broadcast barrier.

use crate::core::{now, Error, Result, Timestamp};
use crate::tensor::{TensorBuffer, TensorSpec};
use std::collections::HashMap;

/// Storage for named model parameters.
pub trait ParameterStore: Send {
    /// Spec of a registered parameter, if known.
    fn parameter_spec(&self, name: &str) -> Option<TensorSpec>;

    /// Replace the named parameters.
    ///
    /// Every tensor is validated before any is applied, so a failed load
    /// leaves the model untouched.
    fn load_weights(&mut self, weights: Vec<(String, TensorBuffer)>) -> Result<()>;

    /// Current value of a parameter.
    fn parameter(&self, name: &str) -> Option<&TensorBuffer>;

    /// Number of successful loads since creation.
    fn version(&self) -> u64;
}

/// Load statistics.
#[derive(Clone, Debug, Default)]
pub struct ModelStats {
    pub tensors_loaded: u64,
    pub bytes_loaded: u64,
    pub rejected_loads: u64,
    pub last_loaded: Option<Timestamp>,
}

/// Host-memory model used by the local engine.
#[derive(Clone, Debug, Default)]
pub struct InMemoryModel {
    /// Registered parameters
    parameters: HashMap<String, TensorBuffer>,
    /// Current version
    version: u64,
    /// Statistics
    stats: ModelStats,
}

impl InMemoryModel {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a zero-initialized parameter.
    pub fn with_parameter(mut self, name: &str, spec: TensorSpec) -> Result<Self> {
        self.register(name, TensorBuffer::zeros(spec)?);
        Ok(self)
    }

    /// Register or overwrite a parameter without bumping the version.
    pub fn register(&mut self, name: &str, value: TensorBuffer) {
        self.parameters.insert(name.to_string(), value);
    }

    /// Names of all registered parameters.
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.parameters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> &ModelStats {
        &self.stats
    }

    fn check(&self, name: &str, value: &TensorBuffer) -> Result<()> {
        let current = self
            .parameters
            .get(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
        if current.spec() != value.spec() {
            return Err(Error::ShapeMismatch {
                name: name.to_string(),
                expected: current.spec().to_string(),
                actual: value.spec().to_string(),
            });
        }
        Ok(())
    }
}

impl ParameterStore for InMemoryModel {
    fn parameter_spec(&self, name: &str) -> Option<TensorSpec> {
        self.parameters.get(name).map(|p| p.spec().clone())
    }

    fn load_weights(&mut self, weights: Vec<(String, TensorBuffer)>) -> Result<()> {
        for (name, value) in &weights {
            if let Err(e) = self.check(name, value) {
                self.stats.rejected_loads += 1;
                return Err(e);
            }
        }

        for (name, value) in weights {
            self.stats.tensors_loaded += 1;
            self.stats.bytes_loaded += value.as_bytes().len() as u64;
            self.parameters.insert(name, value);
        }
        self.version += 1;
        self.stats.last_loaded = Some(now());
        Ok(())
    }

    fn parameter(&self, name: &str) -> Option<&TensorBuffer> {
        self.parameters.get(name)
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    fn model() -> InMemoryModel {
        InMemoryModel::new()
            .with_parameter("layer.weight", TensorSpec::new(DType::Float32, vec![2, 2]))
            .unwrap()
    }

    #[test]
    fn test_load_replaces_parameter() {
        let mut model = model();
        let value = TensorBuffer::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();

        model
            .load_weights(vec![("layer.weight".to_string(), value.clone())])
            .unwrap();

        assert_eq!(model.version(), 1);
        assert_eq!(model.parameter("layer.weight"), Some(&value));
        assert_eq!(model.stats().bytes_loaded, 16);
    }

    #[test]
    fn test_shape_mismatch_leaves_model_untouched() {
        let mut model = model();
        let wrong = TensorBuffer::from_f32(vec![4], &[1.0; 4]).unwrap();

        let err = model
            .load_weights(vec![("layer.weight".to_string(), wrong)])
            .unwrap_err();

        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert_eq!(model.version(), 0);
        assert_eq!(
            model.parameter("layer.weight").unwrap().to_f32_vec().unwrap(),
            vec![0.0; 4]
        );
        assert_eq!(model.stats().rejected_loads, 1);
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let mut model = model();
        let value = TensorBuffer::from_f32(vec![1], &[1.0]).unwrap();
        let err = model
            .load_weights(vec![("missing.bias".to_string(), value)])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownParameter(_)));
    }

    #[test]
    fn test_parameter_names_sorted() {
        let model = model()
            .with_parameter("embed.weight", TensorSpec::new(DType::BFloat16, vec![8]))
            .unwrap();
        assert_eq!(model.parameter_names(), vec!["embed.weight", "layer.weight"]);
    }
}
