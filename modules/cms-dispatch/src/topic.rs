//! The closed catalog of outbox topics.

use std::fmt;

/// Every topic the dispatcher knows how to route.
///
/// Business modules publish these as dot-namespaced strings
/// (`post.created`, `tags.nightly.stats`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PostCreated,
    PostUpdated,
    PostDeleted,
    TagCreated,
    TagUpdated,
    TagDeleted,
    UserCreated,
    UserUpdated,
    UserDeleted,
    CommentCreated,
    CommentUpdated,
    CommentDeleted,
    FormCreated,
    FormUpdated,
    FormDeleted,
    FieldCreated,
    FieldUpdated,
    FieldDeleted,
    SubmissionCreated,
    SubmissionUpdated,
    SubmissionDeleted,
    TagsNightlyStats,
}

impl EventKind {
    pub const COUNT: usize = 22;

    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::PostCreated,
        EventKind::PostUpdated,
        EventKind::PostDeleted,
        EventKind::TagCreated,
        EventKind::TagUpdated,
        EventKind::TagDeleted,
        EventKind::UserCreated,
        EventKind::UserUpdated,
        EventKind::UserDeleted,
        EventKind::CommentCreated,
        EventKind::CommentUpdated,
        EventKind::CommentDeleted,
        EventKind::FormCreated,
        EventKind::FormUpdated,
        EventKind::FormDeleted,
        EventKind::FieldCreated,
        EventKind::FieldUpdated,
        EventKind::FieldDeleted,
        EventKind::SubmissionCreated,
        EventKind::SubmissionUpdated,
        EventKind::SubmissionDeleted,
        EventKind::TagsNightlyStats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PostCreated => "post.created",
            EventKind::PostUpdated => "post.updated",
            EventKind::PostDeleted => "post.deleted",
            EventKind::TagCreated => "tag.created",
            EventKind::TagUpdated => "tag.updated",
            EventKind::TagDeleted => "tag.deleted",
            EventKind::UserCreated => "user.created",
            EventKind::UserUpdated => "user.updated",
            EventKind::UserDeleted => "user.deleted",
            EventKind::CommentCreated => "comment.created",
            EventKind::CommentUpdated => "comment.updated",
            EventKind::CommentDeleted => "comment.deleted",
            EventKind::FormCreated => "form.created",
            EventKind::FormUpdated => "form.updated",
            EventKind::FormDeleted => "form.deleted",
            EventKind::FieldCreated => "field.created",
            EventKind::FieldUpdated => "field.updated",
            EventKind::FieldDeleted => "field.deleted",
            EventKind::SubmissionCreated => "submission.created",
            EventKind::SubmissionUpdated => "submission.updated",
            EventKind::SubmissionDeleted => "submission.deleted",
            EventKind::TagsNightlyStats => "tags.nightly.stats",
        }
    }

    /// Position in `ALL`. Used by the registry's handler table.
    pub fn index(&self) -> usize {
        *self as usize
    }

    fn lookup(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A topic string as read back from the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Known(EventKind),
    Unknown(String),
}

impl Topic {
    /// Total: every string is either a catalog topic or `Unknown`.
    pub fn parse(s: &str) -> Self {
        match EventKind::lookup(s) {
            Some(kind) => Topic::Known(kind),
            None => Topic::Unknown(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Topic::Known(kind) => kind.as_str(),
            Topic::Unknown(raw) => raw,
        }
    }
}

impl From<EventKind> for Topic {
    fn from(kind: EventKind) -> Self {
        Topic::Known(kind)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_round_trips() {
        for kind in EventKind::ALL {
            assert_eq!(Topic::parse(kind.as_str()), Topic::Known(kind));
        }
    }

    #[test]
    fn index_matches_position_in_all() {
        for (i, kind) in EventKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn unrecognized_topic_is_unknown() {
        assert_eq!(
            Topic::parse("post.archived"),
            Topic::Unknown("post.archived".to_string())
        );
        assert_eq!(Topic::parse("").as_str(), "");
    }

    #[test]
    fn parse_is_case_sensitive() {
        assert!(matches!(Topic::parse("Post.Created"), Topic::Unknown(_)));
    }
}
