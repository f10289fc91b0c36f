use serde::Deserialize;

/// `GET /api/models` catalogue. Parsed permissively: absent metadata means
/// no extra capability suffixes are advertised.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelCatalogue {
    #[serde(default)]
    pub data: Vec<CatalogueModel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogueModel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub info: Option<ModelInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub meta: ModelMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelMeta {
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub chat_type: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub thinking: bool,
}

impl CatalogueModel {
    pub fn supports_thinking(&self) -> bool {
        self.info
            .as_ref()
            .is_some_and(|info| info.meta.capabilities.thinking)
    }

    pub fn chat_types(&self) -> &[String] {
        self.info
            .as_ref()
            .map(|info| info.meta.chat_type.as_slice())
            .unwrap_or(&[])
    }
}
