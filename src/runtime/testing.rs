//! Mock implementations for testing
//!
//! The store under test is always a real in-memory database; the dialog and
//! predictor collaborators are mocked.

use super::{DatabaseStorage, EventSink, ServerEvent, SessionManager, SessionSettings};
use crate::context::{ContextAssembler, DEFAULT_CONTEXT_LIMIT};
use crate::db::Database;
use crate::llm::{Dialog, DialogReply, DialogRequest, Intent, LlmError};
use crate::parameters::{DiseaseSchema, DiseaseType, ParameterRegistry};
use crate::predictor::{PredictionOutcome, Predictor, PredictorError, PredictorRegistry};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Reply with the given intent, entities and text
pub fn reply(intent: &str, entities: &[&str], response: &str) -> DialogReply {
    DialogReply {
        intent: Intent::from(intent.to_string()),
        entities: entities.iter().map(|e| (*e).to_string()).collect(),
        confidence: 0.9,
        response: response.to_string(),
        follow_up_questions: Vec::new(),
        recommendations: Vec::new(),
    }
}

// ============================================================================
// Mock Dialog
// ============================================================================

/// Mock dialog that returns queued replies
pub struct MockDialog {
    replies: Mutex<VecDeque<Result<DialogReply, LlmError>>>,
    /// Record of all requests made
    pub requests: Mutex<Vec<DialogRequest>>,
}

impl MockDialog {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_reply(&self, reply: DialogReply) {
        self.replies.lock().unwrap().push_back(Ok(reply));
    }

    pub fn queue_error(&self, error: LlmError) {
        self.replies.lock().unwrap().push_back(Err(error));
    }

    pub fn recorded_requests(&self) -> Vec<DialogRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockDialog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialog for MockDialog {
    async fn process(&self, request: &DialogRequest) -> Result<DialogReply, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock reply queued")))
    }

    fn model_id(&self) -> &str {
        "mock-dialog"
    }
}

/// Dialog that always fails
pub struct FailingDialog;

#[async_trait]
impl Dialog for FailingDialog {
    async fn process(&self, _request: &DialogRequest) -> Result<DialogReply, LlmError> {
        Err(LlmError::server_error("Server error: upstream exploded"))
    }

    fn model_id(&self) -> &str {
        "failing-dialog"
    }
}

/// Echoes each message back after a delay
pub struct DelayedMockDialog {
    delay: Duration,
    /// Notified when a request starts
    pub request_started: Arc<Notify>,
}

impl DelayedMockDialog {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            request_started: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl Dialog for DelayedMockDialog {
    async fn process(&self, request: &DialogRequest) -> Result<DialogReply, LlmError> {
        self.request_started.notify_waiters();
        tokio::time::sleep(self.delay).await;
        Ok(reply("general", &[], &format!("echo: {}", request.message)))
    }

    fn model_id(&self) -> &str {
        "delayed-dialog"
    }
}

// ============================================================================
// Mock Predictor
// ============================================================================

pub struct MockPredictor {
    result: Result<PredictionOutcome, PredictorError>,
    delay: Option<Duration>,
    /// Parameters of every call
    pub calls: Mutex<Vec<BTreeMap<String, String>>>,
}

impl MockPredictor {
    pub fn returning(label: &str, confidence: f64) -> Self {
        Self {
            result: Ok(PredictionOutcome::new(label, confidence)),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(PredictorError::Failed(message.to_string())),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Predictor for MockPredictor {
    async fn predict(
        &self,
        _schema: &DiseaseSchema,
        parameters: &BTreeMap<String, String>,
    ) -> Result<PredictionOutcome, PredictorError> {
        self.calls.lock().unwrap().push(parameters.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone()
    }
}

// ============================================================================
// Test Harness
// ============================================================================

/// A session manager over an in-memory database plus one client's event stream
pub struct TestHarness {
    pub db: Database,
    pub manager: Arc<SessionManager<DatabaseStorage>>,
    pub sink: EventSink,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
}

pub struct TestHarnessBuilder {
    dialog: Arc<dyn Dialog>,
    predictors: PredictorRegistry,
    settings: SessionSettings,
    context_limit: usize,
}

impl TestHarness {
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder {
            dialog: Arc::new(MockDialog::new()),
            predictors: PredictorRegistry::new(),
            settings: SessionSettings::default(),
            context_limit: DEFAULT_CONTEXT_LIMIT,
        }
    }

    /// Next event, failing the test if none arrives in time
    pub async fn next_event(&mut self) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Skip events until one named `name` arrives
    pub async fn wait_for(&mut self, name: &str) -> ServerEvent {
        loop {
            let event = self.next_event().await;
            if event_name(&event) == name {
                return event;
            }
        }
    }

    /// Drain whatever has arrived within `settle`
    pub async fn drain(&mut self, settle: Duration) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(settle, self.events.recv()).await {
            events.push(event);
        }
        events
    }

    /// Create an empty conversation for `user_id` and return its id
    pub async fn conversation(&mut self, user_id: &str) -> String {
        self.manager.new_conversation(user_id, None, &self.sink).await;
        match self.wait_for("conversation_created").await {
            ServerEvent::ConversationCreated { conversation } => conversation.id,
            other => panic!("unexpected event {other:?}"),
        }
    }

    /// Create a standalone prediction and return its id
    pub async fn prediction(&mut self, user_id: &str, disease: DiseaseType) -> String {
        self.manager
            .new_prediction(user_id, disease, None, &self.sink)
            .await;
        match self.wait_for("prediction_created").await {
            ServerEvent::PredictionCreated { prediction } => prediction.id,
            other => panic!("unexpected event {other:?}"),
        }
    }
}

impl TestHarnessBuilder {
    pub fn dialog(mut self, dialog: Arc<dyn Dialog>) -> Self {
        self.dialog = dialog;
        self
    }

    pub fn predictor(mut self, disease: DiseaseType, predictor: Arc<dyn Predictor>) -> Self {
        self.predictors.register(disease, predictor);
        self
    }

    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn context_limit(mut self, limit: usize) -> Self {
        self.context_limit = limit;
        self
    }

    pub fn build(self) -> TestHarness {
        let db = Database::open_in_memory().unwrap();
        let storage = DatabaseStorage::new(db.clone());
        let context = ContextAssembler::new(storage.clone(), self.context_limit);
        let manager = SessionManager::new(
            storage,
            context,
            self.dialog,
            Arc::new(self.predictors),
            Arc::new(ParameterRegistry::builtin()),
            self.settings,
        );
        let (sink, events) = mpsc::unbounded_channel();

        TestHarness {
            db,
            manager: Arc::new(manager),
            sink,
            events,
        }
    }
}

/// Wire name of an event
pub fn event_name(event: &ServerEvent) -> String {
    serde_json::to_value(event).unwrap()["event"]
        .as_str()
        .unwrap()
        .to_string()
}

pub const DIABETES_VALUES: [(&str, &str); 8] = [
    ("pregnancy_count", "2"),
    ("glucose_level", "140"),
    ("blood_pressure", "80"),
    ("skin_thickness", "20"),
    ("insulin", "85"),
    ("bmi", "31.2"),
    ("diabetes_pedigree", "0.5"),
    ("age", "45"),
];

pub const KIDNEY_VALUES: [(&str, &str); 8] = [
    ("age", "45"),
    ("blood_pressure", "80"),
    ("specific_gravity", "1.02"),
    ("albumin", "1"),
    ("sugar", "0"),
    ("red_blood_cells", "1"),
    ("pus_cell", "1"),
    ("pus_cell_clumps", "0"),
];

pub fn changes(values: &[(&str, &str)]) -> super::ParameterChanges {
    super::ParameterChanges {
        set: values
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
        remove: Vec::new(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConversationStatus, MessageMetadata, MessageType, PredictionStatus};
    use crate::runtime::{ErrorKind, ParameterChanges};
    use crate::state_machine::Phase;

    fn expect_error(event: ServerEvent) -> (String, ErrorKind, Option<String>) {
        match event {
            ServerEvent::Error {
                message,
                kind,
                field,
            } => (message, kind, field),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_new_conversation_without_content() {
        let mut h = TestHarness::builder().build();

        h.manager.new_conversation("alice", None, &h.sink).await;
        let conversation = match h.next_event().await {
            ServerEvent::ConversationCreated { conversation } => conversation,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(conversation.message_count, 0);
        assert_eq!(conversation.title, "New Conversation");

        h.manager.get_messages("alice", &conversation.id, &h.sink).await;
        match h.next_event().await {
            ServerEvent::MessagesLoaded { messages, .. } => assert!(messages.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_new_conversation_with_content_processes_it() {
        let dialog = Arc::new(MockDialog::new());
        dialog.queue_reply(reply("greeting", &[], "Hello! How can I help?"));
        let mut h = TestHarness::builder().dialog(dialog).build();

        h.manager
            .new_conversation("alice", Some("Hi there".to_string()), &h.sink)
            .await;
        let id = match h.wait_for("conversation_created").await {
            ServerEvent::ConversationCreated { conversation } => conversation.id,
            other => panic!("unexpected {other:?}"),
        };
        h.wait_for("ai_response").await;

        let conversation = h.db.get_conversation(&id).unwrap();
        assert_eq!(conversation.message_count, 2);
        assert_eq!(conversation.title, "Hi there");
    }

    #[tokio::test]
    async fn test_message_exchange() {
        let dialog = Arc::new(MockDialog::new());
        dialog.queue_reply(reply("symptom_analysis", &["headache"], "How long has it lasted?"));
        let mut h = TestHarness::builder().dialog(dialog.clone()).build();
        let id = h.conversation("alice").await;

        h.manager
            .send_message("alice", &id, "I have a headache".to_string(), &h.sink)
            .await;

        match h.next_event().await {
            ServerEvent::MessageSaved { message, .. } => {
                assert_eq!(message.index, 0);
                assert_eq!(message.message_type, MessageType::User);
                let metadata = message.metadata.unwrap();
                assert_eq!(metadata.intent, "symptom_analysis");
                assert_eq!(metadata.entities, vec!["headache"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match h.next_event().await {
            ServerEvent::AiResponse {
                message, intent, ..
            } => {
                assert_eq!(message.index, 1);
                assert_eq!(message.content.as_deref(), Some("How long has it lasted?"));
                assert!(message.metadata.is_none());
                assert_eq!(intent, "symptom_analysis");
            }
            other => panic!("unexpected {other:?}"),
        }

        // Second turn sees the first exchange as history
        dialog.queue_reply(reply("general", &[], "Noted."));
        h.manager
            .send_message("alice", &id, "Two days".to_string(), &h.sink)
            .await;
        h.wait_for("ai_response").await;

        let requests = dialog.recorded_requests();
        assert!(requests[0].history.is_empty());
        assert_eq!(requests[1].history.len(), 2);
        assert_eq!(requests[1].message, "Two days");
    }

    #[tokio::test]
    async fn test_dialog_failure_persists_nothing() {
        let mut h = TestHarness::builder().dialog(Arc::new(FailingDialog)).build();
        let id = h.conversation("alice").await;

        h.manager
            .send_message("alice", &id, "Hello?".to_string(), &h.sink)
            .await;
        let (message, kind, _) = expect_error(h.next_event().await);
        assert_eq!(kind, ErrorKind::ExternalService);
        assert!(!message.contains("exploded"));

        assert!(h.db.get_messages(&id).unwrap().is_empty());
        assert_eq!(h.db.get_conversation(&id).unwrap().message_count, 0);
    }

    #[tokio::test]
    async fn test_dialog_error_then_recovery() {
        let dialog = Arc::new(MockDialog::new());
        dialog.queue_error(LlmError::rate_limit("Rate limit exceeded"));
        dialog.queue_reply(reply("general", &[], "Hello again."));
        let mut h = TestHarness::builder().dialog(dialog.clone()).build();
        let id = h.conversation("alice").await;

        h.manager.send_message("alice", &id, "first".to_string(), &h.sink).await;
        assert_eq!(expect_error(h.next_event().await).1, ErrorKind::ExternalService);

        h.manager.send_message("alice", &id, "second".to_string(), &h.sink).await;
        match h.next_event().await {
            ServerEvent::MessageSaved { message, .. } => {
                assert_eq!(message.index, 0);
                assert_eq!(message.content.as_deref(), Some("second"));
            }
            other => panic!("unexpected {other:?}"),
        }
        h.wait_for("ai_response").await;

        let requests = dialog.recorded_requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].history.is_empty());
    }

    #[tokio::test]
    async fn test_dialog_timeout_persists_nothing() {
        let settings = SessionSettings {
            dialog_timeout: Duration::from_millis(50),
            ..SessionSettings::default()
        };
        let mut h = TestHarness::builder()
            .dialog(Arc::new(DelayedMockDialog::new(Duration::from_millis(500))))
            .settings(settings)
            .build();
        let id = h.conversation("alice").await;

        h.manager
            .send_message("alice", &id, "Hello?".to_string(), &h.sink)
            .await;
        let (message, kind, _) = expect_error(h.next_event().await);
        assert_eq!(kind, ErrorKind::ExternalService);
        assert!(message.contains("too long"));
        assert!(h.db.get_messages(&id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_n_messages_give_2n_ordered_entries() {
        let mut h = TestHarness::builder()
            .dialog(Arc::new(DelayedMockDialog::new(Duration::ZERO)))
            .build();
        let id = h.conversation("alice").await;

        for i in 0..5 {
            h.manager
                .send_message("alice", &id, format!("message {i}"), &h.sink)
                .await;
        }
        for _ in 0..5 {
            h.wait_for("ai_response").await;
        }

        let messages = h.db.get_messages(&id).unwrap();
        assert_eq!(messages.len(), 10);
        for (i, pair) in messages.chunks(2).enumerate() {
            assert_eq!(pair[0].message_type, MessageType::User);
            assert_eq!(pair[1].message_type, MessageType::Ai);
            assert_eq!(pair[0].content.as_deref(), Some(format!("message {i}").as_str()));
        }
        assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(h.db.get_conversation(&id).unwrap().message_count, 10);
    }

    #[tokio::test]
    async fn test_concurrent_messages_are_serialized() {
        let mut h = TestHarness::builder()
            .dialog(Arc::new(DelayedMockDialog::new(Duration::from_millis(30))))
            .build();
        let id = h.conversation("alice").await;

        let (m1, m2) = (h.manager.clone(), h.manager.clone());
        let (s1, s2) = (h.sink.clone(), h.sink.clone());
        let (id1, id2) = (id.clone(), id.clone());
        let first = tokio::spawn(async move { m1.send_message("alice", &id1, "first".to_string(), &s1).await });
        let second = tokio::spawn(async move { m2.send_message("alice", &id2, "second".to_string(), &s2).await });
        first.await.unwrap();
        second.await.unwrap();

        h.wait_for("ai_response").await;
        h.wait_for("ai_response").await;

        let messages = h.db.get_messages(&id).unwrap();
        assert_eq!(messages.len(), 4);
        for pair in messages.chunks(2) {
            let user = pair[0].content.clone().unwrap();
            assert_eq!(pair[0].message_type, MessageType::User);
            assert_eq!(pair[1].content.clone().unwrap(), format!("echo: {user}"));
        }
        let mut users: Vec<_> = messages
            .iter()
            .filter(|m| m.message_type == MessageType::User)
            .filter_map(|m| m.content.clone())
            .collect();
        users.sort();
        assert_eq!(users, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_messages_apply_in_arrival_order() {
        let mut h = TestHarness::builder()
            .dialog(Arc::new(DelayedMockDialog::new(Duration::from_millis(30))))
            .build();
        let id = h.conversation("alice").await;

        // Each call only enqueues, so both are queued before the first reply
        h.manager.send_message("alice", &id, "first".to_string(), &h.sink).await;
        h.manager.send_message("alice", &id, "second".to_string(), &h.sink).await;
        h.wait_for("ai_response").await;
        h.wait_for("ai_response").await;

        let contents: Vec<_> = h
            .db
            .get_messages(&id)
            .unwrap()
            .into_iter()
            .filter_map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["first", "echo: first", "second", "echo: second"]);
    }

    #[tokio::test]
    async fn test_full_queue_reports_busy_without_blocking() {
        let mut h = TestHarness::builder()
            .dialog(Arc::new(DelayedMockDialog::new(Duration::from_millis(300))))
            .build();
        let a = h.conversation("alice").await;
        let b = h.conversation("alice").await;

        let start = std::time::Instant::now();
        for i in 0..41 {
            h.manager.send_message("alice", &a, format!("m{i}"), &h.sink).await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));

        let rejected = h.drain(Duration::from_millis(20)).await;
        assert!(rejected.len() >= 8, "only {} rejections", rejected.len());
        for event in rejected {
            let (message, kind, _) = expect_error(event);
            assert_eq!(kind, ErrorKind::ExternalService);
            assert!(message.contains("busy"));
        }

        // Another conversation is unaffected
        h.manager.send_message("alice", &b, "hello".to_string(), &h.sink).await;
        loop {
            if let ServerEvent::AiResponse { conversation_id, .. } = h.wait_for("ai_response").await {
                if conversation_id == b {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_conversations_proceed_in_parallel() {
        let dialog = Arc::new(DelayedMockDialog::new(Duration::from_millis(200)));
        let mut h = TestHarness::builder().dialog(dialog).build();
        let a = h.conversation("alice").await;
        let b = h.conversation("alice").await;

        let start = std::time::Instant::now();
        h.manager.send_message("alice", &a, "one".to_string(), &h.sink).await;
        h.manager.send_message("alice", &b, "two".to_string(), &h.sink).await;
        h.wait_for("ai_response").await;
        h.wait_for("ai_response").await;
        assert!(start.elapsed() < Duration::from_millis(390));
    }

    #[tokio::test]
    async fn test_closed_conversation_rejects_messages() {
        let mut h = TestHarness::builder().build();
        let id = h.conversation("alice").await;

        h.manager.close_conversation("alice", &id, &h.sink).await;
        assert!(matches!(h.next_event().await, ServerEvent::ConversationClosed { .. }));
        assert_eq!(h.db.get_conversation(&id).unwrap().status, ConversationStatus::Closed);

        h.manager
            .send_message("alice", &id, "anyone?".to_string(), &h.sink)
            .await;
        let (_, kind, field) = expect_error(h.next_event().await);
        assert_eq!(kind, ErrorKind::Validation);
        assert_eq!(field.as_deref(), Some("conversation_id"));
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let mut h = TestHarness::builder().build();
        let id = h.conversation("alice").await;

        h.manager.send_message("alice", &id, "   ".to_string(), &h.sink).await;
        let (_, kind, field) = expect_error(h.next_event().await);
        assert_eq!(kind, ErrorKind::Validation);
        assert_eq!(field.as_deref(), Some("content"));
    }

    #[tokio::test]
    async fn test_other_users_cannot_touch_conversation() {
        let mut h = TestHarness::builder().build();
        let id = h.conversation("alice").await;

        h.manager.get_messages("mallory", &id, &h.sink).await;
        assert_eq!(expect_error(h.next_event().await).1, ErrorKind::NotFound);

        h.manager.delete_conversation("mallory", &id, &h.sink).await;
        assert_eq!(expect_error(h.next_event().await).1, ErrorKind::NotFound);
        assert!(h.db.get_conversation(&id).is_ok());

        h.manager.list_conversations("mallory", &h.sink).await;
        match h.next_event().await {
            ServerEvent::ConversationsLoaded { conversations } => assert!(conversations.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_message_metadata() {
        let dialog = Arc::new(MockDialog::new());
        dialog.queue_reply(reply("general", &[], "Sure."));
        let mut h = TestHarness::builder().dialog(dialog).build();
        let id = h.conversation("alice").await;
        h.manager.send_message("alice", &id, "hi".to_string(), &h.sink).await;
        h.wait_for("ai_response").await;

        let metadata = MessageMetadata {
            intent: "greeting".to_string(),
            entities: vec!["hello".to_string()],
            confidence: 0.4,
        };
        h.manager
            .update_message_metadata("alice", &id, 0, metadata.clone(), &h.sink)
            .await;
        assert!(matches!(h.next_event().await, ServerEvent::MetadataUpdated { .. }));

        h.manager.get_message_metadata("alice", &id, 0, &h.sink).await;
        match h.next_event().await {
            ServerEvent::Metadata { metadata: m, .. } => assert_eq!(m, Some(metadata)),
            other => panic!("unexpected {other:?}"),
        }

        h.manager.get_message_metadata("alice", &id, 1, &h.sink).await;
        match h.next_event().await {
            ServerEvent::Metadata { metadata, .. } => assert!(metadata.is_none()),
            other => panic!("unexpected {other:?}"),
        }

        h.manager.get_message_metadata("alice", &id, 9, &h.sink).await;
        let (_, kind, field) = expect_error(h.next_event().await);
        assert_eq!(kind, ErrorKind::Validation);
        assert_eq!(field.as_deref(), Some("message_index"));
    }

    #[tokio::test]
    async fn test_metadata_read_follows_pending_update() {
        let mut h = TestHarness::builder()
            .dialog(Arc::new(DelayedMockDialog::new(Duration::from_millis(50))))
            .build();
        let id = h.conversation("alice").await;
        h.manager.send_message("alice", &id, "hi".to_string(), &h.sink).await;
        h.wait_for("ai_response").await;

        let metadata = MessageMetadata {
            intent: "greeting".to_string(),
            entities: vec!["hello".to_string()],
            confidence: 0.4,
        };
        // Keep the actor busy so the update is still queued when the read arrives
        h.manager.send_message("alice", &id, "again".to_string(), &h.sink).await;
        h.manager
            .update_message_metadata("alice", &id, 0, metadata.clone(), &h.sink)
            .await;
        h.manager.get_message_metadata("alice", &id, 0, &h.sink).await;
        h.manager.get_messages("alice", &id, &h.sink).await;

        let names: Vec<_> = h
            .drain(Duration::from_millis(200))
            .await
            .into_iter()
            .map(|event| match event {
                ServerEvent::Metadata { metadata: m, .. } => {
                    assert_eq!(m.as_ref(), Some(&metadata));
                    "metadata".to_string()
                }
                ServerEvent::MessagesLoaded { messages, .. } => {
                    assert_eq!(messages.len(), 4);
                    assert_eq!(messages[0].metadata.as_ref(), Some(&metadata));
                    "messages_loaded".to_string()
                }
                other => event_name(&other),
            })
            .collect();
        assert_eq!(
            names,
            vec!["message_saved", "ai_response", "metadata_updated", "metadata", "messages_loaded"]
        );
    }

    #[tokio::test]
    async fn test_delete_conversation() {
        let mut h = TestHarness::builder().build();
        let id = h.conversation("alice").await;

        h.manager.delete_conversation("alice", &id, &h.sink).await;
        assert!(matches!(h.next_event().await, ServerEvent::ConversationDeleted { .. }));

        // The actor has stopped; a later command gets a fresh one and a clean error
        h.manager.send_message("alice", &id, "hello".to_string(), &h.sink).await;
        assert_eq!(expect_error(h.next_event().await).1, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_idle_actor_shuts_down_and_respawns() {
        let settings = SessionSettings {
            idle_timeout: Duration::from_millis(20),
            ..SessionSettings::default()
        };
        let mut h = TestHarness::builder()
            .dialog(Arc::new(DelayedMockDialog::new(Duration::ZERO)))
            .settings(settings)
            .build();
        let id = h.conversation("alice").await;

        h.manager.send_message("alice", &id, "one".to_string(), &h.sink).await;
        h.wait_for("ai_response").await;
        assert_eq!(h.manager.active_sessions().await, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.manager.active_sessions().await, 0);

        h.manager.send_message("alice", &id, "two".to_string(), &h.sink).await;
        h.wait_for("ai_response").await;
        assert_eq!(h.db.get_messages(&id).unwrap().len(), 4);
    }

    // ==================== Predictions ====================

    #[tokio::test]
    async fn test_retired_actors_leave_the_session_map() {
        let settings = SessionSettings {
            idle_timeout: Duration::from_millis(10),
            ..SessionSettings::default()
        };
        let mut h = TestHarness::builder().settings(settings).build();

        for i in 0..50 {
            h.manager
                .send_message("alice", &format!("missing-{i}"), "hello".to_string(), &h.sink)
                .await;
        }
        for _ in 0..50 {
            assert_eq!(expect_error(h.next_event().await).1, ErrorKind::NotFound);
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.manager.tracked_sessions().await, 0);
        assert_eq!(h.manager.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_standalone_prediction_flow() {
        let dialog = Arc::new(MockDialog::new());
        let mut guidance = reply("guidance", &[], "Thanks.");
        guidance.follow_up_questions = vec!["Do you exercise?".to_string()];
        guidance.recommendations = vec!["Monitor glucose weekly".to_string()];
        dialog.queue_reply(guidance);

        let predictor = Arc::new(MockPredictor::returning("high risk", 0.82));
        let mut h = TestHarness::builder()
            .dialog(dialog)
            .predictor(DiseaseType::Diabetes, predictor.clone())
            .build();

        h.manager
            .new_prediction("alice", DiseaseType::Diabetes, None, &h.sink)
            .await;
        let id = match h.next_event().await {
            ServerEvent::PredictionCreated { prediction } => {
                assert_eq!(prediction.status, PredictionStatus::Pending);
                prediction.id
            }
            other => panic!("unexpected {other:?}"),
        };
        match h.next_event().await {
            ServerEvent::WorkflowUpdated { workflow, .. } => {
                assert_eq!(workflow.phase, Phase::Collecting);
                assert_eq!(workflow.pending.len(), 8);
                assert!(workflow.next_prompt.unwrap().starts_with("Please provide Number of times pregnant"));
            }
            other => panic!("unexpected {other:?}"),
        }

        h.manager
            .update_prediction("alice", &id, changes(&DIABETES_VALUES), &h.sink)
            .await;
        let mut updated = 0;
        let workflow = loop {
            match h.next_event().await {
                ServerEvent::ParameterUpdated { .. } => updated += 1,
                ServerEvent::WorkflowUpdated { workflow, .. } => break workflow,
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(updated, 8);
        assert_eq!(workflow.phase, Phase::ReadyToConfirm);
        assert!(workflow.is_complete);

        match h.next_event().await {
            ServerEvent::PredictionUpdated { prediction } => {
                assert_eq!(prediction.parameters.len(), 8);
                assert_eq!(prediction.follow_up_questions, vec!["Do you exercise?"]);
                assert_eq!(prediction.recommendations, vec!["Monitor glucose weekly"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        h.manager.predict("alice", &id, &h.sink).await;
        match h.next_event().await {
            ServerEvent::PredictionCompleted { result, .. } => {
                assert_eq!(result, PredictionOutcome::new("high risk", 0.82));
            }
            other => panic!("unexpected {other:?}"),
        }
        match h.next_event().await {
            ServerEvent::WorkflowUpdated { workflow, .. } => assert_eq!(workflow.phase, Phase::Dispatched),
            other => panic!("unexpected {other:?}"),
        }

        let record = h.db.get_prediction(&id).unwrap();
        assert_eq!(record.status, PredictionStatus::Completed);
        assert_eq!(record.result, Some(PredictionOutcome::new("high risk", 0.82)));
        assert_eq!(predictor.calls.lock().unwrap()[0].get("bmi").map(String::as_str), Some("31.2"));

        // Dispatched is terminal
        h.manager.predict("alice", &id, &h.sink).await;
        assert_eq!(expect_error(h.next_event().await).1, ErrorKind::Validation);
        assert_eq!(predictor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_update_is_all_or_nothing() {
        let mut h = TestHarness::builder().build();
        let id = h.prediction("alice", DiseaseType::Diabetes).await;
        h.drain(Duration::from_millis(20)).await;

        h.manager
            .update_prediction(
                "alice",
                &id,
                changes(&[("glucose_level", "140"), ("age", "150")]),
                &h.sink,
            )
            .await;
        let (message, kind, field) = expect_error(h.next_event().await);
        assert_eq!(kind, ErrorKind::Validation);
        assert_eq!(field.as_deref(), Some("age"));
        assert_eq!(message, "Value for age must be between 21 and 90");
        assert!(h.db.get_prediction(&id).unwrap().parameters.is_empty());

        h.manager
            .update_prediction("alice", &id, ParameterChanges::default(), &h.sink)
            .await;
        assert_eq!(expect_error(h.next_event().await).1, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_guidance_failure_is_not_fatal() {
        // The mock dialog has nothing queued, so the guidance call fails
        let mut h = TestHarness::builder().build();
        let id = h.prediction("alice", DiseaseType::Diabetes).await;

        h.manager
            .update_prediction("alice", &id, changes(&[("glucose_level", "120")]), &h.sink)
            .await;
        match h.wait_for("prediction_updated").await {
            ServerEvent::PredictionUpdated { prediction } => {
                assert_eq!(prediction.parameters.get("glucose_level").map(String::as_str), Some("120"));
                assert!(prediction.follow_up_questions.is_empty());
                assert!(prediction.recommendations.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remove_parameter_resumes_collection() {
        let mut h = TestHarness::builder().build();
        let id = h.prediction("alice", DiseaseType::Diabetes).await;
        h.manager
            .update_prediction("alice", &id, changes(&DIABETES_VALUES), &h.sink)
            .await;
        h.wait_for("prediction_updated").await;

        let removal = ParameterChanges {
            set: Vec::new(),
            remove: vec!["glucose_level".to_string()],
        };
        h.manager.update_prediction("alice", &id, removal, &h.sink).await;
        match h.wait_for("parameter_updated").await {
            ServerEvent::ParameterUpdated { parameter_name, parameter_value, .. } => {
                assert_eq!(parameter_name, "glucose_level");
                assert!(parameter_value.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        match h.wait_for("workflow_updated").await {
            ServerEvent::WorkflowUpdated { workflow, .. } => {
                assert_eq!(workflow.phase, Phase::Collecting);
                assert_eq!(workflow.pending, vec!["glucose_level"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_predict_requires_complete_workflow() {
        let mut h = TestHarness::builder()
            .predictor(DiseaseType::Diabetes, Arc::new(MockPredictor::returning("low", 0.1)))
            .build();
        let id = h.prediction("alice", DiseaseType::Diabetes).await;
        h.drain(Duration::from_millis(20)).await;

        h.manager.predict("alice", &id, &h.sink).await;
        let (message, kind, field) = expect_error(h.next_event().await);
        assert_eq!(kind, ErrorKind::Validation);
        assert_eq!(field.as_deref(), Some("pregnancy_count"));
        assert!(message.starts_with("Missing parameters: pregnancy_count, glucose_level"));
    }

    #[tokio::test]
    async fn test_missing_predictor_is_not_found() {
        let mut h = TestHarness::builder().build();
        let id = h.prediction("alice", DiseaseType::Kidney).await;
        h.manager
            .update_prediction("alice", &id, changes(&KIDNEY_VALUES), &h.sink)
            .await;
        h.wait_for("prediction_updated").await;

        h.manager.predict("alice", &id, &h.sink).await;
        let (message, kind, _) = expect_error(h.next_event().await);
        assert_eq!(kind, ErrorKind::NotFound);
        assert_eq!(message, "No predictor found for kidney");
        assert_eq!(h.db.get_prediction(&id).unwrap().status, PredictionStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_prediction_can_be_retried() {
        let failing = Arc::new(MockPredictor::failing("model crashed"));
        let mut h = TestHarness::builder()
            .predictor(DiseaseType::Diabetes, failing.clone())
            .build();
        let id = h.prediction("alice", DiseaseType::Diabetes).await;
        h.manager
            .update_prediction("alice", &id, changes(&DIABETES_VALUES), &h.sink)
            .await;
        h.wait_for("prediction_updated").await;

        h.manager.predict("alice", &id, &h.sink).await;
        let (message, kind, _) = expect_error(h.next_event().await);
        assert_eq!(kind, ErrorKind::ExternalService);
        assert!(!message.contains("crashed"));

        h.manager.predict("alice", &id, &h.sink).await;
        assert_eq!(expect_error(h.next_event().await).1, ErrorKind::ExternalService);
        assert_eq!(failing.call_count(), 2);
        assert_eq!(h.db.get_prediction(&id).unwrap().status, PredictionStatus::Pending);
    }

    #[tokio::test]
    async fn test_predictor_timeout() {
        let settings = SessionSettings {
            predictor_timeout: Duration::from_millis(30),
            ..SessionSettings::default()
        };
        let slow = MockPredictor::returning("low", 0.2).with_delay(Duration::from_millis(500));
        let mut h = TestHarness::builder()
            .predictor(DiseaseType::Diabetes, Arc::new(slow))
            .settings(settings)
            .build();
        let id = h.prediction("alice", DiseaseType::Diabetes).await;
        h.manager
            .update_prediction("alice", &id, changes(&DIABETES_VALUES), &h.sink)
            .await;
        h.wait_for("prediction_updated").await;

        h.manager.predict("alice", &id, &h.sink).await;
        let (message, kind, _) = expect_error(h.next_event().await);
        assert_eq!(kind, ErrorKind::ExternalService);
        assert!(message.contains("too long"));
        assert_eq!(h.db.get_prediction(&id).unwrap().status, PredictionStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_clears_values() {
        let mut h = TestHarness::builder().build();
        let id = h.prediction("alice", DiseaseType::Diabetes).await;
        h.manager
            .update_prediction("alice", &id, changes(&[("age", "45")]), &h.sink)
            .await;
        h.wait_for("prediction_updated").await;

        h.manager.cancel_prediction("alice", &id, &h.sink).await;
        h.wait_for("prediction_cancelled").await;
        assert!(h.db.get_prediction(&id).unwrap().parameters.is_empty());
    }

    #[tokio::test]
    async fn test_predictions_are_owned() {
        let mut h = TestHarness::builder().build();
        let id = h.prediction("alice", DiseaseType::Heart).await;
        h.drain(Duration::from_millis(20)).await;

        h.manager.predict("mallory", &id, &h.sink).await;
        assert_eq!(expect_error(h.next_event().await).1, ErrorKind::NotFound);

        h.manager.delete_prediction("mallory", &id, &h.sink).await;
        assert_eq!(expect_error(h.next_event().await).1, ErrorKind::NotFound);

        h.manager.delete_prediction("alice", &id, &h.sink).await;
        assert!(matches!(h.next_event().await, ServerEvent::PredictionDeleted { .. }));

        h.manager.list_predictions("alice", &h.sink).await;
        match h.next_event().await {
            ServerEvent::PredictionsLoaded { predictions } => assert!(predictions.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_prediction_for_missing_conversation() {
        let mut h = TestHarness::builder().build();
        h.manager
            .new_prediction("alice", DiseaseType::Liver, Some("nope".to_string()), &h.sink)
            .await;
        assert_eq!(expect_error(h.next_event().await).1, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_chat_drives_workflow() {
        let dialog = Arc::new(MockDialog::new());
        dialog.queue_reply(reply("start_prediction", &["diabetes"], "Let's check your diabetes risk."));
        dialog.queue_reply(reply(
            "update_parameter",
            &["glucose_level=140", "age: 45"],
            "Got it.",
        ));
        dialog.queue_reply(reply("delete_parameter", &["age"], "Removed your age."));
        dialog.queue_reply(reply("cancel_prediction", &[], "Cancelled."));
        let mut h = TestHarness::builder().dialog(dialog).build();
        let conv = h.conversation("alice").await;

        h.manager
            .send_message("alice", &conv, "Check my diabetes risk".to_string(), &h.sink)
            .await;
        let prediction_id = match h.wait_for("prediction_created").await {
            ServerEvent::PredictionCreated { prediction } => {
                assert_eq!(prediction.conversation_id.as_deref(), Some(conv.as_str()));
                prediction.id
            }
            other => panic!("unexpected {other:?}"),
        };
        h.wait_for("workflow_updated").await;

        h.manager
            .send_message("alice", &conv, "glucose 140, I'm 45".to_string(), &h.sink)
            .await;
        match h.wait_for("workflow_updated").await {
            ServerEvent::WorkflowUpdated { workflow, .. } => {
                assert_eq!(workflow.collected.len(), 2);
                assert_eq!(workflow.collected.get("age").map(String::as_str), Some("45"));
            }
            other => panic!("unexpected {other:?}"),
        }

        h.manager
            .send_message("alice", &conv, "forget my age".to_string(), &h.sink)
            .await;
        match h.wait_for("parameter_updated").await {
            ServerEvent::ParameterUpdated { parameter_name, parameter_value, .. } => {
                assert_eq!(parameter_name, "age");
                assert!(parameter_value.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }

        h.manager
            .send_message("alice", &conv, "never mind".to_string(), &h.sink)
            .await;
        h.wait_for("prediction_cancelled").await;

        let record = h.db.get_prediction(&prediction_id).unwrap();
        assert!(record.parameters.is_empty());
        assert_eq!(h.db.get_messages(&conv).unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_chat_sets_single_parameter() {
        let dialog = Arc::new(MockDialog::new());
        dialog.queue_reply(reply("start_prediction", &["diabetes"], "Let's begin."));
        dialog.queue_reply(reply("update_parameter", &["age=45"], "Noted."));
        let mut h = TestHarness::builder().dialog(dialog).build();
        let conv = h.conversation("alice").await;

        h.manager
            .send_message("alice", &conv, "Check my diabetes risk".to_string(), &h.sink)
            .await;
        let prediction_id = match h.wait_for("prediction_created").await {
            ServerEvent::PredictionCreated { prediction } => prediction.id,
            other => panic!("unexpected {other:?}"),
        };
        h.wait_for("workflow_updated").await;

        h.manager.send_message("alice", &conv, "I'm 45".to_string(), &h.sink).await;
        match h.wait_for("parameter_updated").await {
            ServerEvent::ParameterUpdated {
                parameter_name,
                parameter_value,
                ..
            } => {
                assert_eq!(parameter_name, "age");
                assert_eq!(parameter_value.as_deref(), Some("45"));
            }
            other => panic!("unexpected {other:?}"),
        }
        h.wait_for("workflow_updated").await;

        let record = h.db.get_prediction(&prediction_id).unwrap();
        assert_eq!(record.parameters.get("age").map(String::as_str), Some("45"));
    }

    #[tokio::test]
    async fn test_workflow_intent_without_prediction_is_ignored() {
        let dialog = Arc::new(MockDialog::new());
        dialog.queue_reply(reply("update_parameter", &["age=45"], "Thanks."));
        let mut h = TestHarness::builder().dialog(dialog).build();
        let conv = h.conversation("alice").await;

        h.manager.send_message("alice", &conv, "I'm 45".to_string(), &h.sink).await;
        h.wait_for("ai_response").await;
        let rest = h.drain(Duration::from_millis(50)).await;
        assert!(rest.is_empty(), "unexpected events {rest:?}");
    }

    #[tokio::test]
    async fn test_context_window_is_bounded() {
        let dialog = Arc::new(MockDialog::new());
        for _ in 0..4 {
            dialog.queue_reply(reply("general", &[], "ok"));
        }
        let mut h = TestHarness::builder().dialog(dialog.clone()).context_limit(4).build();
        let conv = h.conversation("alice").await;
        for i in 0..4 {
            h.manager.send_message("alice", &conv, format!("m{i}"), &h.sink).await;
            h.wait_for("ai_response").await;
        }

        let requests = dialog.recorded_requests();
        let lengths: Vec<_> = requests.iter().map(|r| r.history.len()).collect();
        assert_eq!(lengths, vec![0, 2, 4, 4]);
        assert_eq!(requests[3].history[0].content, "m1");
        assert_eq!(h.db.get_messages(&conv).unwrap().len(), 8);
    }
}
