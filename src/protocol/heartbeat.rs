use crate::protocol::message::{Message, MessageBody};

/// Builds a keep-alive ping message
pub fn build_ping() -> Message {
    Message::ping()
}

/// Builds the correlated answer to a received ping
pub fn build_ping_reply(ping: &Message) -> Message {
    Message::reply_to(ping, MessageBody::Ping)
}

/// Returns true for any keep-alive message, request or reply
pub fn is_ping(msg: &Message) -> bool {
    matches!(msg.body, MessageBody::Ping)
}

/// Returns true for a ping that expects an answer
pub fn is_ping_request(msg: &Message) -> bool {
    is_ping(msg) && msg.replied_id.is_none()
}
