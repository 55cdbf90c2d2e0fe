use chrono::Utc;
use taskmesh::context_strategy::{ContextStrategy, TrimStrategy};
use taskmesh::message_builder::{Message, Role};

fn message(id: &str, task_id: Option<&str>) -> Message {
    Message {
        id: id.to_string(),
        project_id: "proj-1".to_string(),
        task_id: task_id.map(|s| s.to_string()),
        role: Role::User,
        timestamp: Utc::now(),
        parts: vec![],
        content: id.to_string(),
    }
}

#[test]
fn default_window_size_matches_documented_default() {
    let strategy = TrimStrategy::default();
    let messages: Vec<Message> = (0..64).map(|i| message(&i.to_string(), None)).collect();
    let windowed = strategy.window(&messages, None);
    assert_eq!(windowed.len(), taskmesh::context_strategy::DEFAULT_WINDOW_SIZE);
}

#[test]
fn window_preserves_message_order() {
    let strategy = TrimStrategy::new(3);
    let messages: Vec<Message> = (0..10).map(|i| message(&i.to_string(), None)).collect();
    let windowed = strategy.window(&messages, None);
    let ids: Vec<&str> = windowed.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["7", "8", "9"]);
}

#[test]
fn empty_conversation_yields_empty_window() {
    let strategy = TrimStrategy::default();
    let windowed = strategy.window(&[], Some("task-1"));
    assert!(windowed.is_empty());
}

#[test]
fn retained_task_messages_are_not_duplicated_when_already_in_the_tail() {
    let strategy = TrimStrategy::new(3);
    let messages = vec![
        message("1", Some("task-1")),
        message("2", None),
        message("3", Some("task-1")),
    ];
    let windowed = strategy.window(&messages, Some("task-1"));
    let ids: Vec<&str> = windowed.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
}
