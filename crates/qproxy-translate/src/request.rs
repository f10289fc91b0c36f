use tracing::debug;
use uuid::Uuid;

use qproxy_protocol::openai::request::{ChatCompletionRequest, ChatMessage, MessageContent, Role};
use qproxy_protocol::qwen::chat::{
    ChatType, CompletionEnvelope, EnvelopeMessage, ExtraMeta, FeatureConfig, FileDescriptor,
    MessageExtra,
};

/// Line prepended to a single-turn message so the upstream does not reuse
/// short-term memory from the freshly created chat.
const RESET_MARKER: &str = "以下是一个全新的对话，请忽略此前的任何上下文。";

/// Non-empty stand-in when an image-generation request carries no text.
const IMAGE_PROMPT_PLACEHOLDER: &str = "请生成图片";

/// History images folded into an edit request are capped at this many.
const MAX_EDIT_IMAGES: usize = 3;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TranslateError {
    #[error("messages must be a non-empty array")]
    EmptyMessages,
    #[error("request has no user message to answer")]
    NoUserMessage,
    #[error("translated envelope failed validation: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Default)]
pub struct TranslateConfig {
    pub vision_fallback_model: Option<String>,
    pub disable_vision_fallback: bool,
}

/// Pure routing decision for a request: which upstream model and modality to
/// use, before any chat is created.
#[derive(Debug, Clone)]
pub struct TranslationPlan {
    pub upstream_model: String,
    pub chat_type: ChatType,
    pub thinking: bool,
    pub used_fallback: bool,
    /// Aspect ratio for image generation, already mapped from `WxH`.
    pub size: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelSuffix {
    Search,
    Thinking,
    Image,
    ImageEdit,
    Video,
}

fn split_model_suffix(model: &str) -> (&str, Option<ModelSuffix>) {
    const SUFFIXES: [(&str, ModelSuffix); 5] = [
        ("-search", ModelSuffix::Search),
        ("-thinking", ModelSuffix::Thinking),
        ("-image_edit", ModelSuffix::ImageEdit),
        ("-image", ModelSuffix::Image),
        ("-video", ModelSuffix::Video),
    ];
    for (text, suffix) in SUFFIXES {
        if let Some(base) = model.strip_suffix(text) {
            return (base, Some(suffix));
        }
    }
    (model, None)
}

pub fn plan(
    request: &ChatCompletionRequest,
    config: &TranslateConfig,
) -> Result<TranslationPlan, TranslateError> {
    if request.messages.is_empty() {
        return Err(TranslateError::EmptyMessages);
    }

    let (base_model, suffix) = split_model_suffix(&request.model);
    let chat_type = match suffix {
        Some(ModelSuffix::Image) => ChatType::Image,
        Some(ModelSuffix::ImageEdit) => ChatType::ImageEdit,
        Some(ModelSuffix::Video) => ChatType::Video,
        // Images in the content never switch the modality by themselves.
        _ => ChatType::Text,
    };

    let has_images = request
        .messages
        .iter()
        .any(|message| message.content.has_images());

    let mut upstream_model = base_model.to_string();
    let mut used_fallback = false;
    if has_images
        && chat_type == ChatType::Text
        && !config.disable_vision_fallback
        && let Some(fallback) = &config.vision_fallback_model
    {
        upstream_model = fallback.clone();
        used_fallback = true;
    }

    let size = if chat_type == ChatType::Image {
        request.size.as_deref().and_then(aspect_ratio)
    } else {
        None
    };

    Ok(TranslationPlan {
        upstream_model,
        chat_type,
        thinking: suffix == Some(ModelSuffix::Thinking),
        used_fallback,
        size,
    })
}

/// Maps an OpenAI pixel size to the upstream's aspect-ratio form. Common
/// sizes come from a fixed table; anything else is GCD-reduced.
fn aspect_ratio(size: &str) -> Option<String> {
    match size {
        "256x256" | "512x512" | "1024x1024" | "2048x2048" => return Some("1:1".to_string()),
        "1792x1024" => return Some("16:9".to_string()),
        "1024x1792" => return Some("9:16".to_string()),
        "1152x768" => return Some("3:2".to_string()),
        "768x1152" => return Some("2:3".to_string()),
        _ => {}
    }
    let (width, height) = size.split_once(['x', 'X'])?;
    let width: u64 = width.trim().parse().ok()?;
    let height: u64 = height.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    let divisor = gcd(width, height);
    Some(format!("{}:{}", width / divisor, height / divisor))
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Builds the single-message completion envelope for an already-created
/// chat. `timestamp` is unix seconds, computed once per request and shared
/// by every message.
pub fn build_envelope(
    plan: &TranslationPlan,
    request: &ChatCompletionRequest,
    chat_id: &str,
    timestamp: i64,
) -> Result<CompletionEnvelope, TranslateError> {
    let last_user = request
        .messages
        .iter()
        .rposition(|message| message.role == Role::User)
        .ok_or(TranslateError::NoUserMessage)?;

    let (content, files, chat_type) = match plan.chat_type {
        ChatType::Image => {
            let mut text = request.messages[last_user].content.text();
            if text.trim().is_empty() {
                text = IMAGE_PROMPT_PLACEHOLDER.to_string();
            }
            (text, Vec::new(), ChatType::Image)
        }
        ChatType::ImageEdit => {
            let text = request.messages[last_user].content.text();
            let images = collect_edit_images(&request.messages, last_user);
            match images.last() {
                Some(url) => {
                    let file = FileDescriptor::vision(url, &guess_image_mime(url), timestamp);
                    (text, vec![file], ChatType::ImageEdit)
                }
                None => {
                    // No usable attachment: fall back to plain generation.
                    debug!(event = "image_edit_downgraded", reason = "no attachment");
                    (text, Vec::new(), ChatType::Image)
                }
            }
        }
        ChatType::Text | ChatType::Video => {
            let content = compress_history(&request.messages, last_user);
            let files = request.messages[last_user]
                .content
                .image_urls()
                .iter()
                .map(|url| FileDescriptor::vision(url, &guess_image_mime(url), timestamp))
                .collect();
            (content, files, plan.chat_type)
        }
    };

    let message = EnvelopeMessage {
        fid: Uuid::new_v4().to_string(),
        parent_id: None,
        children_ids: Vec::new(),
        role: "user".to_string(),
        content,
        user_action: Some("chat".to_string()),
        files,
        timestamp,
        models: vec![plan.upstream_model.clone()],
        chat_type,
        feature_config: FeatureConfig::new(plan.thinking),
        extra: MessageExtra {
            meta: ExtraMeta {
                sub_chat_type: chat_type,
            },
        },
        sub_chat_type: chat_type,
    };

    let wants_stream = request.wants_stream();
    let envelope = CompletionEnvelope {
        stream: wants_stream,
        incremental_output: wants_stream,
        chat_id: chat_id.to_string(),
        chat_mode: "normal".to_string(),
        model: plan.upstream_model.clone(),
        parent_id: None,
        messages: vec![message],
        timestamp,
        size: plan.size.clone(),
    };
    validate_envelope(&envelope)?;
    Ok(envelope)
}

/// Folds the multi-turn history into one user message: the upstream rejects
/// assistant messages in a freshly created chat, so prior turns become a
/// transcript and only the last user turn stays a question.
fn compress_history(messages: &[ChatMessage], last_user: usize) -> String {
    let question = messages[last_user].content.text();
    let system = messages
        .iter()
        .find(|message| message.role == Role::System)
        .map(|message| message.content.text())
        .filter(|text| !text.is_empty());

    let prior: Vec<&ChatMessage> = messages[..last_user]
        .iter()
        .filter(|message| message.role != Role::System)
        .collect();

    let mut content = String::new();
    if let Some(system) = system {
        content.push_str("系统提示：");
        content.push_str(&system);
        content.push_str("\n\n");
    }

    if prior.is_empty() {
        content.push_str(RESET_MARKER);
        content.push('\n');
        content.push_str(&question);
    } else {
        content.push_str("对话历史：\n");
        for message in prior {
            let speaker = match message.role {
                Role::Assistant => "助手",
                _ => "用户",
            };
            content.push_str(speaker);
            content.push_str(": ");
            content.push_str(&message.content.text());
            content.push('\n');
        }
        content.push_str("\n当前问题：");
        content.push_str(&question);
    }
    content
}

/// Image candidates for an edit request: current-message parts first, then
/// history images from the newest message upward (user parts and Markdown,
/// assistant Markdown), capped to the trailing MAX_EDIT_IMAGES.
fn collect_edit_images(messages: &[ChatMessage], last_user: usize) -> Vec<String> {
    let mut images = messages[last_user].content.image_urls();

    for message in messages[..last_user].iter().rev() {
        match message.role {
            Role::User => {
                images.extend(message.content.image_urls());
                images.extend(markdown_image_urls(&message.content.text()));
            }
            Role::Assistant => {
                if let MessageContent::Text(text) = &message.content {
                    images.extend(markdown_image_urls(text));
                }
            }
            Role::System => {}
        }
    }

    if images.len() > MAX_EDIT_IMAGES {
        images.split_off(images.len() - MAX_EDIT_IMAGES)
    } else {
        images
    }
}

/// Extracts the targets of Markdown image references `![...](url)`.
fn markdown_image_urls(text: &str) -> Vec<String> {
    let mut urls = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("![") {
        rest = &rest[start + 2..];
        let Some(open) = rest.find("](") else { break };
        rest = &rest[open + 2..];
        let Some(close) = rest.find(')') else { break };
        let url = rest[..close].trim();
        if !url.is_empty() {
            urls.push(url.to_string());
        }
        rest = &rest[close + 1..];
    }
    urls
}

/// Content type from a data URL's MIME or the URL extension.
fn guess_image_mime(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((mime, _)) = rest.split_once(';')
    {
        return mime.to_string();
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('.').next().map(str::to_ascii_lowercase) {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg".to_string(),
        Some(ext) if ext == "gif" => "image/gif".to_string(),
        Some(ext) if ext == "webp" => "image/webp".to_string(),
        Some(ext) if ext == "bmp" => "image/bmp".to_string(),
        _ => "image/png".to_string(),
    }
}

fn validate_envelope(envelope: &CompletionEnvelope) -> Result<(), TranslateError> {
    if envelope.chat_id.is_empty() {
        return Err(TranslateError::Invalid("missing chat_id"));
    }
    for message in &envelope.messages {
        if message.fid.is_empty() {
            return Err(TranslateError::Invalid("message missing fid"));
        }
        if message.role.is_empty() {
            return Err(TranslateError::Invalid("message missing role"));
        }
        if message.role == "user" {
            if message.user_action.is_none() {
                return Err(TranslateError::Invalid("user message missing user_action"));
            }
            if message.timestamp <= 0 {
                return Err(TranslateError::Invalid("user message missing timestamp"));
            }
            if message.models.is_empty() {
                return Err(TranslateError::Invalid("user message missing models"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: &str) -> ChatCompletionRequest {
        serde_json::from_str(json).unwrap()
    }

    fn text_request(model: &str) -> ChatCompletionRequest {
        request(&format!(
            r#"{{"model":"{model}","messages":[{{"role":"user","content":"hi"}}]}}"#
        ))
    }

    #[test]
    fn suffixes_drive_chat_type() {
        let config = TranslateConfig::default();
        let cases = [
            ("qwen-max", ChatType::Text, "qwen-max"),
            ("qwen-max-search", ChatType::Text, "qwen-max"),
            ("qwen-max-thinking", ChatType::Text, "qwen-max"),
            ("qwen-max-image", ChatType::Image, "qwen-max"),
            ("qwen-max-image_edit", ChatType::ImageEdit, "qwen-max"),
            ("qwen-max-video", ChatType::Video, "qwen-max"),
        ];
        for (model, chat_type, upstream) in cases {
            let plan = plan(&text_request(model), &config).unwrap();
            assert_eq!(plan.chat_type, chat_type, "{model}");
            assert_eq!(plan.upstream_model, upstream, "{model}");
        }
    }

    #[test]
    fn thinking_flag_tracks_the_original_suffix() {
        let config = TranslateConfig::default();
        assert!(plan(&text_request("qwen-max-thinking"), &config).unwrap().thinking);
        assert!(!plan(&text_request("qwen-max"), &config).unwrap().thinking);
    }

    #[test]
    fn empty_messages_is_rejected_before_any_upstream_call() {
        let req = request(r#"{"model":"qwen-max","messages":[]}"#);
        assert!(matches!(
            plan(&req, &TranslateConfig::default()),
            Err(TranslateError::EmptyMessages)
        ));
    }

    #[test]
    fn vision_fallback_replaces_model_but_keeps_t2t() {
        let req = request(
            r#"{"model":"qwen-max","messages":[{"role":"user","content":[
                {"type":"text","text":"what is this?"},
                {"type":"image_url","image_url":{"url":"https://host/x.png"}}
            ]}]}"#,
        );
        let config = TranslateConfig {
            vision_fallback_model: Some("qwen3-vl-plus".to_string()),
            disable_vision_fallback: false,
        };
        let plan = plan(&req, &config).unwrap();
        assert!(plan.used_fallback);
        assert_eq!(plan.upstream_model, "qwen3-vl-plus");
        assert_eq!(plan.chat_type, ChatType::Text);

        let envelope = build_envelope(&plan, &req, "C1", 1_700_000_000).unwrap();
        let files = &envelope.messages[0].files;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].url, "https://host/x.png");
        assert_eq!(files[0].file_type, "image/png");
        assert_eq!(files[0].file_class, "vision");
        assert_eq!(files[0].status, "uploaded");
        assert_eq!(files[0].size, 0);
    }

    #[test]
    fn fallback_is_skipped_when_disabled_or_unset() {
        let req = request(
            r#"{"model":"qwen-max","messages":[{"role":"user","content":[
                {"type":"image_url","image_url":{"url":"https://host/x.png"}}
            ]}]}"#,
        );
        let disabled = TranslateConfig {
            vision_fallback_model: Some("qwen3-vl-plus".to_string()),
            disable_vision_fallback: true,
        };
        assert!(!plan(&req, &disabled).unwrap().used_fallback);
        assert!(!plan(&req, &TranslateConfig::default()).unwrap().used_fallback);
    }

    #[test]
    fn image_model_ignores_fallback_even_with_images() {
        let req = request(
            r#"{"model":"qwen-max-image","messages":[{"role":"user","content":[
                {"type":"image_url","image_url":{"url":"https://host/x.png"}}
            ]}]}"#,
        );
        let config = TranslateConfig {
            vision_fallback_model: Some("qwen3-vl-plus".to_string()),
            disable_vision_fallback: false,
        };
        let plan = plan(&req, &config).unwrap();
        assert!(!plan.used_fallback);
        assert_eq!(plan.chat_type, ChatType::Image);
    }

    #[test]
    fn aspect_ratio_table_overrides_gcd() {
        assert_eq!(aspect_ratio("1792x1024").as_deref(), Some("16:9"));
        assert_eq!(aspect_ratio("1024x1792").as_deref(), Some("9:16"));
        assert_eq!(aspect_ratio("512x512").as_deref(), Some("1:1"));
        assert_eq!(aspect_ratio("1152x768").as_deref(), Some("3:2"));
    }

    #[test]
    fn aspect_ratio_reduces_by_gcd() {
        assert_eq!(aspect_ratio("1920x1080").as_deref(), Some("16:9"));
        assert_eq!(aspect_ratio("640x480").as_deref(), Some("4:3"));
        assert_eq!(aspect_ratio("700x300").as_deref(), Some("7:3"));
        assert_eq!(aspect_ratio("banana"), None);
        assert_eq!(aspect_ratio("0x100"), None);
    }

    #[test]
    fn image_generation_envelope() {
        let req = request(
            r#"{"model":"qwen-max-image","messages":[{"role":"user","content":"draw a cat"}],
                "size":"1792x1024"}"#,
        );
        let plan = plan(&req, &TranslateConfig::default()).unwrap();
        let envelope = build_envelope(&plan, &req, "C1", 1_700_000_000).unwrap();

        assert_eq!(envelope.size.as_deref(), Some("16:9"));
        assert_eq!(envelope.model, "qwen-max");
        let message = &envelope.messages[0];
        assert_eq!(message.chat_type, ChatType::Image);
        assert_eq!(message.content, "draw a cat");
        assert!(message.files.is_empty());
        assert!(!message.feature_config.thinking_enabled);
    }

    #[test]
    fn image_generation_without_text_uses_placeholder() {
        let req = request(
            r#"{"model":"qwen-max-image","messages":[{"role":"user","content":""}]}"#,
        );
        let plan = plan(&req, &TranslateConfig::default()).unwrap();
        let envelope = build_envelope(&plan, &req, "C1", 1).unwrap();
        assert!(!envelope.messages[0].content.is_empty());
    }

    #[test]
    fn multi_turn_history_is_compressed_into_a_transcript() {
        let req = request(
            r#"{"model":"qwen-max","messages":[
                {"role":"user","content":"a"},
                {"role":"assistant","content":"b"},
                {"role":"user","content":"c"}
            ]}"#,
        );
        let plan = plan(&req, &TranslateConfig::default()).unwrap();
        let envelope = build_envelope(&plan, &req, "C1", 1_700_000_000).unwrap();

        assert_eq!(envelope.messages.len(), 1);
        let content = &envelope.messages[0].content;
        assert!(content.starts_with("对话历史：\n"));
        assert!(content.contains("用户: a\n"));
        assert!(content.contains("助手: b\n"));
        assert!(content.ends_with("当前问题：c"));
        assert!(!content.contains(RESET_MARKER));
        assert!(!envelope.messages[0].feature_config.thinking_enabled);
    }

    #[test]
    fn single_turn_gets_the_reset_marker() {
        let req = text_request("qwen-max");
        let plan = plan(&req, &TranslateConfig::default()).unwrap();
        let envelope = build_envelope(&plan, &req, "C1", 1_700_000_000).unwrap();

        let content = &envelope.messages[0].content;
        assert!(content.starts_with(RESET_MARKER));
        assert!(content.ends_with("hi"));
        assert!(!content.contains("对话历史"));
    }

    #[test]
    fn system_message_is_prepended() {
        let req = request(
            r#"{"model":"qwen-max","messages":[
                {"role":"system","content":"be terse"},
                {"role":"user","content":"hi"}
            ]}"#,
        );
        let plan = plan(&req, &TranslateConfig::default()).unwrap();
        let envelope = build_envelope(&plan, &req, "C1", 1).unwrap();
        assert!(envelope.messages[0].content.starts_with("系统提示：be terse"));
    }

    #[test]
    fn edit_images_cap_at_trailing_three() {
        let req = request(
            r#"{"model":"qwen-max-image_edit","messages":[
                {"role":"user","content":[{"type":"image_url","image_url":{"url":"h1"}}]},
                {"role":"assistant","content":"here ![one](h2) and ![two](h3)"},
                {"role":"user","content":[
                    {"type":"text","text":"edit this"},
                    {"type":"image_url","image_url":{"url":"c1"}},
                    {"type":"image_url","image_url":{"url":"c2"}}
                ]}
            ]}"#,
        );
        let images = collect_edit_images(&req.messages, 2);
        // Insertion order: current first, then newest history upward.
        assert_eq!(images, vec!["h2", "h3", "h1"]);
    }

    #[test]
    fn edit_uses_the_last_candidate_image() {
        let req = request(
            r#"{"model":"qwen-max-image_edit","messages":[
                {"role":"user","content":[
                    {"type":"text","text":"edit"},
                    {"type":"image_url","image_url":{"url":"https://h/a.jpg"}},
                    {"type":"image_url","image_url":{"url":"https://h/b.jpg"}}
                ]}
            ]}"#,
        );
        let plan = plan(&req, &TranslateConfig::default()).unwrap();
        let envelope = build_envelope(&plan, &req, "C1", 1).unwrap();
        let message = &envelope.messages[0];
        assert_eq!(message.chat_type, ChatType::ImageEdit);
        assert_eq!(message.files.len(), 1);
        assert_eq!(message.files[0].url, "https://h/b.jpg");
        assert_eq!(message.files[0].file_type, "image/jpeg");
    }

    #[test]
    fn edit_without_any_image_downgrades_to_generation() {
        let req = request(
            r#"{"model":"qwen-max-image_edit","messages":[{"role":"user","content":"no image"}]}"#,
        );
        let plan = plan(&req, &TranslateConfig::default()).unwrap();
        let envelope = build_envelope(&plan, &req, "C1", 1).unwrap();
        let message = &envelope.messages[0];
        assert_eq!(message.chat_type, ChatType::Image);
        assert!(message.files.is_empty());
    }

    #[test]
    fn envelope_invariants_hold() {
        let req = request(
            r#"{"model":"qwen-max-thinking","messages":[{"role":"user","content":"hi"}]}"#,
        );
        let plan = plan(&req, &TranslateConfig::default()).unwrap();
        let envelope = build_envelope(&plan, &req, "C9", 1_700_000_042).unwrap();

        assert_eq!(envelope.chat_id, "C9");
        assert_eq!(envelope.chat_mode, "normal");
        assert!(envelope.parent_id.is_none());
        let message = &envelope.messages[0];
        assert!(!message.fid.is_empty());
        assert!(message.parent_id.is_none());
        assert!(message.children_ids.is_empty());
        assert_eq!(message.user_action.as_deref(), Some("chat"));
        assert_eq!(message.timestamp, envelope.timestamp);
        assert_eq!(message.models, vec!["qwen-max"]);
        assert!(message.feature_config.thinking_enabled);
        assert_eq!(message.feature_config.output_schema, "phase");
        assert_eq!(message.sub_chat_type, message.chat_type);
    }

    #[test]
    fn same_input_and_timestamp_differ_only_in_fresh_ids() {
        let req = text_request("qwen-max");
        let plan = plan(&req, &TranslateConfig::default()).unwrap();
        let a = build_envelope(&plan, &req, "C1", 42).unwrap();
        let b = build_envelope(&plan, &req, "C1", 42).unwrap();

        assert_eq!(a.messages[0].content, b.messages[0].content);
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.model, b.model);
        assert_ne!(a.messages[0].fid, b.messages[0].fid);
    }

    #[test]
    fn markdown_scanner_finds_image_urls() {
        let urls = markdown_image_urls("before ![alt](https://a/1.png) mid ![](https://a/2.png)");
        assert_eq!(urls, vec!["https://a/1.png", "https://a/2.png"]);
        assert!(markdown_image_urls("no images [link](https://a)").is_empty());
    }

    #[test]
    fn mime_guessing_covers_data_urls_and_extensions() {
        assert_eq!(guess_image_mime("data:image/webp;base64,xxxx"), "image/webp");
        assert_eq!(guess_image_mime("https://h/photo.JPG?w=1"), "image/jpeg");
        assert_eq!(guess_image_mime("https://h/no-extension"), "image/png");
    }

    #[test]
    fn stream_choice_is_mirrored_into_the_envelope() {
        let req = request(
            r#"{"model":"qwen-max","messages":[{"role":"user","content":"hi"}],"stream":false}"#,
        );
        let plan = plan(&req, &TranslateConfig::default()).unwrap();
        let envelope = build_envelope(&plan, &req, "C1", 1).unwrap();
        assert!(!envelope.stream);
        assert!(!envelope.incremental_output);
    }
}
