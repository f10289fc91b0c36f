use qproxy_protocol::openai::models::{ModelEntry, ModelList};
use qproxy_protocol::qwen::models::CatalogueModel;

/// Expands the upstream catalogue into the downstream list: each model is
/// followed by synthetic suffix entries for the capabilities it advertises.
pub fn expand_catalogue(models: &[CatalogueModel], created: i64) -> ModelList {
    let mut data = Vec::with_capacity(models.len() * 2);
    for model in models {
        data.push(ModelEntry::new(model.id.clone(), created));

        if model.supports_thinking() {
            data.push(ModelEntry::new(format!("{}-thinking", model.id), created));
        }
        let chat_types = model.chat_types();
        if chat_types.iter().any(|t| t == "search") {
            data.push(ModelEntry::new(format!("{}-search", model.id), created));
        }
        let mut has_image_edit = false;
        if chat_types.iter().any(|t| t == "t2i") {
            data.push(ModelEntry::new(format!("{}-image", model.id), created));
            data.push(ModelEntry::new(format!("{}-image_edit", model.id), created));
            has_image_edit = true;
        }
        if !has_image_edit && chat_types.iter().any(|t| t == "image_edit") {
            data.push(ModelEntry::new(format!("{}-image_edit", model.id), created));
        }
    }
    ModelList::new(data)
}

/// Static catalogue served when the upstream returns nothing, so clients
/// can keep selecting models.
pub fn fallback_models(created: i64) -> ModelList {
    const IDS: [&str; 8] = [
        "qwen-max-latest",
        "qwen-plus",
        "qwen-turbo",
        "qwen-long",
        "qwen3-235b-a22b",
        "qwen3-coder-plus",
        "qwen2.5-omni-7b",
        "qvq-72b-preview",
    ];
    ModelList::new(IDS.map(|id| ModelEntry::new(id, created)).to_vec())
}
