use serde::Serialize;
use shared::{
    domain::{FileId, TaskId},
    protocol::ChatMessage,
};

/// Narrows a room's messages to one attachment. `None` in an
/// `Option<ChatFilter>` means the whole room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatFilter {
    File(FileId),
    Task(TaskId),
}

impl ChatFilter {
    pub fn matches(&self, message: &ChatMessage) -> bool {
        match self {
            Self::File(file_id) => message.file_id == Some(*file_id),
            Self::Task(task_id) => message.task_id == Some(*task_id),
        }
    }

    pub fn file_id(&self) -> Option<FileId> {
        match self {
            Self::File(file_id) => Some(*file_id),
            Self::Task(_) => None,
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Task(task_id) => Some(*task_id),
            Self::File(_) => None,
        }
    }
}

/// Query parameters of a durable read for a scope.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
}

impl From<Option<&ChatFilter>> for ScopeQuery {
    fn from(filter: Option<&ChatFilter>) -> Self {
        Self {
            file_id: filter.and_then(ChatFilter::file_id).map(|id| id.0),
            task_id: filter.and_then(ChatFilter::task_id).map(|id| id.0),
        }
    }
}

pub fn matches_filter(filter: Option<&ChatFilter>, message: &ChatMessage) -> bool {
    filter.map_or(true, |filter| filter.matches(message))
}

/// Projects an ordered sequence onto the active filter, keeping order.
pub fn project<'a, I>(messages: I, filter: Option<&ChatFilter>) -> Vec<&'a ChatMessage>
where
    I: IntoIterator<Item = &'a ChatMessage>,
{
    messages
        .into_iter()
        .filter(|message| matches_filter(filter, message))
        .collect()
}

/// Whether history loaded for `loaded` already contains everything `wanted`
/// would fetch. Whole-room history covers every scope.
pub fn scope_covers(loaded: Option<&ChatFilter>, wanted: Option<&ChatFilter>) -> bool {
    match loaded {
        None => true,
        Some(loaded) => wanted == Some(loaded),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use shared::{
        domain::{MessageId, RoomId, UserId},
        protocol::AuthorProjection,
    };

    use super::*;

    fn message(id: i64, file_id: Option<i64>, task_id: Option<i64>) -> ChatMessage {
        ChatMessage {
            id: MessageId(id),
            content: format!("m{id}"),
            author_id: UserId(1),
            author: AuthorProjection::placeholder(UserId(1)),
            room_id: RoomId(3),
            file_id: file_id.map(FileId),
            task_id: task_id.map(TaskId),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn no_filter_projects_the_whole_room() {
        let messages = vec![
            message(1, None, None),
            message(2, Some(10), None),
            message(3, None, Some(20)),
        ];
        let projected = project(&messages, None);
        assert_eq!(projected.len(), messages.len());
        assert!(projected.iter().zip(&messages).all(|(a, b)| *a == b));
    }

    #[test]
    fn file_filter_keeps_exactly_that_attachment_in_order() {
        let messages = vec![
            message(1, Some(10), None),
            message(2, Some(11), None),
            message(3, None, Some(10)),
            message(4, Some(10), None),
        ];
        let filter = ChatFilter::File(FileId(10));
        let ids: Vec<i64> = project(&messages, Some(&filter))
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[test]
    fn whole_room_history_covers_every_scope() {
        let file = ChatFilter::File(FileId(1));
        let task = ChatFilter::Task(TaskId(1));
        assert!(scope_covers(None, Some(&file)));
        assert!(scope_covers(Some(&file), Some(&file)));
        assert!(!scope_covers(Some(&file), Some(&task)));
        assert!(!scope_covers(Some(&file), None));
    }

    #[test]
    fn scope_query_renders_only_the_active_scope() {
        let query = ScopeQuery::from(Some(&ChatFilter::Task(TaskId(5))));
        assert_eq!(query.task_id, Some(5));
        assert_eq!(query.file_id, None);
        assert_eq!(ScopeQuery::from(None), ScopeQuery::default());
    }
}
