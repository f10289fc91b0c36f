use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upstream conversational modality, selected by the downstream model
/// suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatType {
    #[serde(rename = "t2t")]
    Text,
    #[serde(rename = "t2i")]
    Image,
    #[serde(rename = "image_edit")]
    ImageEdit,
    #[serde(rename = "t2v")]
    Video,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Text => "t2t",
            ChatType::Image => "t2i",
            ChatType::ImageEdit => "image_edit",
            ChatType::Video => "t2v",
        }
    }
}

/// `POST /api/v2/chats/new` body. Chats are created out-of-band before each
/// completion; the returned id scopes the completion call.
#[derive(Debug, Clone, Serialize)]
pub struct NewChatRequest {
    pub title: String,
    pub models: Vec<String>,
    pub chat_mode: String,
    pub chat_type: ChatType,
    pub timestamp: i64,
}

impl NewChatRequest {
    pub fn new(model: &str, chat_type: ChatType, timestamp_ms: i64) -> Self {
        Self {
            title: "New Chat".to_string(),
            models: vec![model.to_string()],
            chat_mode: "normal".to_string(),
            chat_type,
            timestamp: timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewChatResponse {
    #[serde(default)]
    pub data: Option<NewChatData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewChatData {
    #[serde(default)]
    pub id: Option<String>,
}

/// Completion envelope posted to `/api/v2/chat/completions?chat_id=<id>`.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionEnvelope {
    pub stream: bool,
    pub incremental_output: bool,
    pub chat_id: String,
    pub chat_mode: String,
    pub model: String,
    pub parent_id: Option<String>,
    pub messages: Vec<EnvelopeMessage>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeMessage {
    pub fid: String,
    #[serde(rename = "parentId")]
    pub parent_id: Option<String>,
    #[serde(rename = "childrenIds")]
    pub children_ids: Vec<String>,
    pub role: String,
    pub content: String,
    /// "chat" for user messages, absent otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_action: Option<String>,
    pub files: Vec<FileDescriptor>,
    pub timestamp: i64,
    pub models: Vec<String>,
    pub chat_type: ChatType,
    pub feature_config: FeatureConfig,
    pub extra: MessageExtra,
    pub sub_chat_type: ChatType,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureConfig {
    pub thinking_enabled: bool,
    pub output_schema: String,
}

impl FeatureConfig {
    pub fn new(thinking_enabled: bool) -> Self {
        Self {
            thinking_enabled,
            output_schema: "phase".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageExtra {
    pub meta: ExtraMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtraMeta {
    #[serde(rename = "subChatType")]
    pub sub_chat_type: ChatType,
}

/// Image attachment on a user message. Attachments are passed by URL, never
/// re-uploaded, so size is 0 and no hash is carried.
#[derive(Debug, Clone, Serialize)]
pub struct FileDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub url: String,
    pub name: String,
    pub size: u64,
    pub file_type: String,
    pub file_class: String,
    #[serde(rename = "showType")]
    pub show_type: String,
    pub status: String,
    #[serde(rename = "itemId")]
    pub item_id: String,
    #[serde(rename = "uploadTaskId")]
    pub upload_task_id: String,
}

impl FileDescriptor {
    pub fn vision(url: &str, file_type: &str, timestamp: i64) -> Self {
        let extension = file_type.rsplit('/').next().unwrap_or("png");
        Self {
            kind: "image".to_string(),
            id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            name: format!("image_{timestamp}.{extension}"),
            size: 0,
            file_type: file_type.to_string(),
            file_class: "vision".to_string(),
            show_type: "image".to_string(),
            status: "uploaded".to_string(),
            item_id: Uuid::new_v4().to_string(),
            upload_task_id: Uuid::new_v4().to_string(),
        }
    }
}

/// `GET /api/v2/chats/?page=N`, consumed by the cleanup scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatListResponse {
    #[serde(default)]
    pub data: Vec<ChatSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSummary {
    pub id: String,
    #[serde(default)]
    pub updated_at: Option<i64>,
}
