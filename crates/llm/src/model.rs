use serde::{Deserialize, Serialize};

/// Identifies the backend model (and optionally region/session) one request targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ModelDescriptor {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            region: None,
            session_id: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub region: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            region: None,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            model_id: self.id.clone(),
            region: self.region.clone(),
            session_id: None,
        }
    }
}

/// The set of models a session may select, keyed by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    models: Vec<Model>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(default_openai_models())
    }
}

impl ModelCatalog {
    pub fn new(models: Vec<Model>) -> Self {
        let mut deduped: Vec<Model> = Vec::with_capacity(models.len());
        for model in models {
            if model.id.trim().is_empty() || deduped.iter().any(|known| known.id == model.id) {
                continue;
            }
            deduped.push(model);
        }

        Self { models: deduped }
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn get(&self, model_id: &str) -> Option<&Model> {
        self.models.iter().find(|model| model.id == model_id)
    }

    pub fn resolve(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.get(model_id).map(Model::descriptor)
    }

    pub fn default_model_id(&self) -> Option<&str> {
        self.models.first().map(|model| model.id.as_str())
    }
}

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

pub fn default_openai_models() -> Vec<Model> {
    vec![
        Model::from_id("gpt-4o-mini").with_description("Balanced cost/performance default"),
        Model::from_id("gpt-4o").with_description("High quality general model"),
        Model::from_id("gpt-4.1").with_description("Reasoning-forward GPT-4.1"),
        Model::from_id("o3").with_description("Advanced reasoning model"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_drops_blank_and_duplicate_ids() {
        let catalog = ModelCatalog::new(vec![
            Model::from_id("claude").with_region("us-east-1"),
            Model::from_id("  "),
            Model::from_id("claude").with_region("eu-west-1"),
            Model::from_id("titan"),
        ]);

        let ids = catalog
            .models()
            .iter()
            .map(|model| model.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["claude", "titan"]);
        assert_eq!(catalog.default_model_id(), Some("claude"));
    }

    #[test]
    fn resolve_carries_region_and_leaves_session_unset() {
        let catalog = ModelCatalog::new(vec![Model::from_id("claude").with_region("us-east-1")]);

        let descriptor = catalog.resolve("claude").expect("known model");
        assert_eq!(descriptor.region.as_deref(), Some("us-east-1"));
        assert_eq!(descriptor.session_id, None);
        assert!(catalog.resolve("unknown").is_none());
    }
}
