mod collect;
mod models;
mod phase;
mod request;
mod stream;

pub use collect::CompletionCollector;
pub use models::{expand_catalogue, fallback_models};
pub use request::{TranslateConfig, TranslateError, TranslationPlan, build_envelope, plan};
pub use stream::ChunkTranslator;
