//! The Model Registry (C2, spec §4.2): holds the user-defined models and
//! splits them into the ordered/unordered worklists the pipeline drives.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::event::RESERVED_MODEL_NAME;
use crate::model::Model;

/// Holds every registered model and the three capability worklists spec §4.2
/// describes: preprocessors run in registration order, reducers and derivers
/// run unordered (the pipeline drives them concurrently/sequentially per
/// phase - see `pipeline.rs`).
pub struct ModelRegistry {
    by_name: HashMap<String, Arc<dyn Model>>,
    preprocessors: Vec<Arc<dyn Model>>,
    reducers: Vec<Arc<dyn Model>>,
    derivers: Vec<Arc<dyn Model>>,
}

impl ModelRegistry {
    /// Registers `models`, rejecting duplicate names, the reserved name
    /// `"metadata"`, empty names, and models declaring none of
    /// preprocessor/reducer/deriver.
    pub fn new(models: Vec<Arc<dyn Model>>) -> Result<Self, RegistryError> {
        let mut by_name = HashMap::with_capacity(models.len());
        let mut preprocessors = Vec::new();
        let mut reducers = Vec::new();
        let mut derivers = Vec::new();

        for model in models {
            let name = model.name();

            if name.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if name == RESERVED_MODEL_NAME {
                return Err(RegistryError::ReservedName);
            }
            if by_name.contains_key(name) {
                return Err(RegistryError::DuplicateName(name.to_string()));
            }
            if !model.has_preprocessor() && !model.has_reducer() && !model.has_deriver() {
                return Err(RegistryError::NoCapabilities(name.to_string()));
            }

            if model.has_preprocessor() {
                preprocessors.push(model.clone());
            }
            if model.has_reducer() {
                reducers.push(model.clone());
            }
            if model.has_deriver() {
                derivers.push(model.clone());
            }

            by_name.insert(name.to_string(), model);
        }

        Ok(ModelRegistry {
            by_name,
            preprocessors,
            reducers,
            derivers,
        })
    }

    /// Preprocessors, in registration order (spec §4.2: "preprocessors (ordered)").
    pub fn preprocessors(&self) -> &[Arc<dyn Model>] {
        &self.preprocessors
    }

    /// Reducers (spec §4.2: "reducers (unordered, run concurrently)").
    pub fn reducers(&self) -> &[Arc<dyn Model>] {
        &self.reducers
    }

    /// Derivers (spec §4.2: "derivers (unordered, run concurrently)").
    pub fn derivers(&self) -> &[Arc<dyn Model>] {
        &self.derivers
    }

    /// Looks up a registered model by name, used by the apply phase to find
    /// the model an entry in `result` belongs to.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Model>> {
        self.by_name.get(name)
    }

    /// Every registered RW model, for the `setWritable` toggle at the start
    /// and end of the apply phase (spec §4.2).
    pub fn set_all_writable(&self, writable: bool) {
        for model in self.by_name.values() {
            model.set_writable(writable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReduceContext, ReduceOutcome};
    use async_trait::async_trait;

    struct Dummy {
        name: &'static str,
        reducer: bool,
    }

    #[async_trait]
    impl Model for Dummy {
        fn name(&self) -> &str {
            self.name
        }

        fn has_reducer(&self) -> bool {
            self.reducer
        }

        async fn reduce(&self, _ctx: &ReduceContext<'_>) -> Result<ReduceOutcome, crate::error::ModelError> {
            Ok(ReduceOutcome::NoChange)
        }
    }

    #[test]
    fn rejects_reserved_name() {
        let m: Arc<dyn Model> = Arc::new(Dummy {
            name: "metadata",
            reducer: true,
        });
        assert!(matches!(ModelRegistry::new(vec![m]), Err(RegistryError::ReservedName)));
    }

    #[test]
    fn rejects_duplicate_names() {
        let a: Arc<dyn Model> = Arc::new(Dummy { name: "foo", reducer: true });
        let b: Arc<dyn Model> = Arc::new(Dummy { name: "foo", reducer: true });
        assert!(matches!(
            ModelRegistry::new(vec![a, b]),
            Err(RegistryError::DuplicateName(_))
        ));
    }

    #[test]
    fn rejects_no_capabilities() {
        let m: Arc<dyn Model> = Arc::new(Dummy {
            name: "foo",
            reducer: false,
        });
        assert!(matches!(
            ModelRegistry::new(vec![m]),
            Err(RegistryError::NoCapabilities(_))
        ));
    }

    #[test]
    fn accepts_a_valid_reducer() {
        let m: Arc<dyn Model> = Arc::new(Dummy { name: "foo", reducer: true });
        let registry = ModelRegistry::new(vec![m]).unwrap();
        assert_eq!(registry.reducers().len(), 1);
        assert!(registry.preprocessors().is_empty());
        assert!(registry.get("foo").is_some());
    }
}
