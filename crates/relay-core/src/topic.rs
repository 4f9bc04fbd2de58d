//! Replication topic naming.
//!
//! Topics look like `{prefix}:events:{app}`, `{prefix}:queries:{app}` and
//! `{prefix}:replies:{node}:{app}`. App ids are escaped so that a `:` inside
//! an id can never make two apps share a topic.

use relay_protocol::NodeId;

/// Default deployment-wide topic prefix.
pub const DEFAULT_TOPIC_PREFIX: &str = "relay";

/// What a topic carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicPurpose {
    /// Channel events fanned out to every node.
    Events,
    /// Member count queries from any node.
    Queries,
    /// Replies addressed to one node.
    Replies(NodeId),
}

fn escape(segment: &str, out: &mut String) {
    for c in segment.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            c => out.push(c),
        }
    }
}

/// Build the topic for an app and purpose.
#[must_use]
pub fn topic_for(prefix: &str, app_id: &str, purpose: &TopicPurpose) -> String {
    let mut topic = String::with_capacity(prefix.len() + app_id.len() + 24);
    topic.push_str(prefix);
    match purpose {
        TopicPurpose::Events => topic.push_str(":events:"),
        TopicPurpose::Queries => topic.push_str(":queries:"),
        TopicPurpose::Replies(node) => {
            topic.push_str(":replies:");
            escape(node.as_str(), &mut topic);
            topic.push(':');
        }
    }
    escape(app_id, &mut topic);
    topic
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        assert_eq!(topic_for("relay", "A", &TopicPurpose::Events), "relay:events:A");
        assert_eq!(topic_for("relay", "A", &TopicPurpose::Queries), "relay:queries:A");
        assert_eq!(
            topic_for("relay", "A", &TopicPurpose::Replies(NodeId::new("n1"))),
            "relay:replies:n1:A"
        );
    }

    #[test]
    fn test_app_ids_are_escaped() {
        let tricky = topic_for("relay", "a:queries:b", &TopicPurpose::Events);
        assert_eq!(tricky, "relay:events:a%3Aqueries%3Ab");
        assert_ne!(
            topic_for("relay", "50%", &TopicPurpose::Events),
            topic_for("relay", "50%25", &TopicPurpose::Events)
        );
    }
}
