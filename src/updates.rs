// src/updates.rs
//
// Update kind taxonomy, the allowed-updates bitmask and the wire envelope.
//
// A queued update is stored as the serialized object `{"<kind>": {...}}`;
// the `update_id` is the queue event id and is spliced in at delivery time
// without reparsing the stored body.  Emitted ids are always masked to 31
// bits because clients rely on the int32 wrap.

// ─── Update kinds ───────────────────────────────────────────────────────────

/// Every update kind the front-end can emit.  Bit positions are stable; new
/// kinds are appended only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum UpdateType {
    Message = 0,
    EditedMessage,
    ChannelPost,
    EditedChannelPost,
    InlineQuery,
    ChosenInlineResult,
    CallbackQuery,
    CustomEvent,
    CustomQuery,
    ShippingQuery,
    PreCheckoutQuery,
    Poll,
    PollAnswer,
    MyChatMember,
    ChatMember,
    ChatJoinRequest,
    ChatBoostUpdated,
    ChatBoostRemoved,
    MessageReaction,
    MessageReactionCount,
    BusinessConnection,
    BusinessMessage,
    EditedBusinessMessage,
    BusinessMessagesDeleted,
}

pub const UPDATE_TYPE_COUNT: u32 = 24;

/// ChatMember, MessageReaction and MessageReactionCount updates are opt-in.
pub const DEFAULT_ALLOWED_UPDATE_TYPES: u32 = ((1 << UPDATE_TYPE_COUNT) - 1)
    & !(1 << UpdateType::ChatMember as u32)
    & !(1 << UpdateType::MessageReaction as u32)
    & !(1 << UpdateType::MessageReactionCount as u32);

pub const ALL_UPDATE_TYPES: u32 = (1 << UPDATE_TYPE_COUNT) - 1;

impl UpdateType {
    /// The field name under which this kind appears in the update object.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::EditedMessage => "edited_message",
            Self::ChannelPost => "channel_post",
            Self::EditedChannelPost => "edited_channel_post",
            Self::InlineQuery => "inline_query",
            Self::ChosenInlineResult => "chosen_inline_result",
            Self::CallbackQuery => "callback_query",
            Self::CustomEvent => "custom_event",
            Self::CustomQuery => "custom_query",
            Self::ShippingQuery => "shipping_query",
            Self::PreCheckoutQuery => "pre_checkout_query",
            Self::Poll => "poll",
            Self::PollAnswer => "poll_answer",
            Self::MyChatMember => "my_chat_member",
            Self::ChatMember => "chat_member",
            Self::ChatJoinRequest => "chat_join_request",
            Self::ChatBoostUpdated => "chat_boost",
            Self::ChatBoostRemoved => "removed_chat_boost",
            Self::MessageReaction => "message_reaction",
            Self::MessageReactionCount => "message_reaction_count",
            Self::BusinessConnection => "business_connection",
            Self::BusinessMessage => "business_message",
            Self::EditedBusinessMessage => "edited_business_message",
            Self::BusinessMessagesDeleted => "deleted_business_messages",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        Some(match name {
            "message" => Self::Message,
            "edited_message" => Self::EditedMessage,
            "channel_post" => Self::ChannelPost,
            "edited_channel_post" => Self::EditedChannelPost,
            "inline_query" => Self::InlineQuery,
            "chosen_inline_result" => Self::ChosenInlineResult,
            "callback_query" => Self::CallbackQuery,
            "custom_event" => Self::CustomEvent,
            "custom_query" => Self::CustomQuery,
            "shipping_query" => Self::ShippingQuery,
            "pre_checkout_query" => Self::PreCheckoutQuery,
            "poll" => Self::Poll,
            "poll_answer" => Self::PollAnswer,
            "my_chat_member" => Self::MyChatMember,
            "chat_member" => Self::ChatMember,
            "chat_join_request" => Self::ChatJoinRequest,
            "chat_boost" => Self::ChatBoostUpdated,
            "removed_chat_boost" => Self::ChatBoostRemoved,
            "message_reaction" => Self::MessageReaction,
            "message_reaction_count" => Self::MessageReactionCount,
            "business_connection" => Self::BusinessConnection,
            "business_message" => Self::BusinessMessage,
            "edited_business_message" => Self::EditedBusinessMessage,
            "deleted_business_messages" => Self::BusinessMessagesDeleted,
            _ => return None,
        })
    }

    pub fn bit(self) -> u32 {
        1 << self as u32
    }

    /// Custom events and queries are never requestable from the outside.
    fn is_internal_only(self) -> bool {
        matches!(self, Self::CustomEvent | Self::CustomQuery)
    }

    pub fn all() -> impl Iterator<Item = UpdateType> {
        const ALL: [UpdateType; UPDATE_TYPE_COUNT as usize] = [
            UpdateType::Message,
            UpdateType::EditedMessage,
            UpdateType::ChannelPost,
            UpdateType::EditedChannelPost,
            UpdateType::InlineQuery,
            UpdateType::ChosenInlineResult,
            UpdateType::CallbackQuery,
            UpdateType::CustomEvent,
            UpdateType::CustomQuery,
            UpdateType::ShippingQuery,
            UpdateType::PreCheckoutQuery,
            UpdateType::Poll,
            UpdateType::PollAnswer,
            UpdateType::MyChatMember,
            UpdateType::ChatMember,
            UpdateType::ChatJoinRequest,
            UpdateType::ChatBoostUpdated,
            UpdateType::ChatBoostRemoved,
            UpdateType::MessageReaction,
            UpdateType::MessageReactionCount,
            UpdateType::BusinessConnection,
            UpdateType::BusinessMessage,
            UpdateType::EditedBusinessMessage,
            UpdateType::BusinessMessagesDeleted,
        ];
        ALL.into_iter()
    }
}

// ─── Allowed-updates mask ───────────────────────────────────────────────────

/// Parse an `allowed_updates` argument (a JSON array of kind names) into a
/// bitmask.  Unknown names are ignored; an empty or unparsable value yields
/// the default mask.  Internal callers (webhook restore) may name the
/// internal-only kinds.
pub fn parse_allowed_updates(value: &str, is_internal: bool) -> u32 {
    let names: Vec<String> = match serde_json::from_str(value) {
        Ok(names) => names,
        Err(_) => {
            // The webhook registry stores the mask as a bare integer.
            if is_internal {
                if let Ok(mask) = value.parse::<u32>() {
                    return mask & ALL_UPDATE_TYPES;
                }
            }
            return DEFAULT_ALLOWED_UPDATE_TYPES;
        }
    };
    if names.is_empty() {
        return DEFAULT_ALLOWED_UPDATE_TYPES;
    }
    let mut mask = 0u32;
    for name in &names {
        if let Some(update_type) = UpdateType::from_str(name) {
            if !update_type.is_internal_only() || is_internal {
                mask |= update_type.bit();
            }
        }
    }
    if mask == 0 {
        DEFAULT_ALLOWED_UPDATE_TYPES
    } else {
        mask
    }
}

/// Render a mask back into the list of kind names, for `getWebhookInfo`.
pub fn allowed_update_names(mask: u32) -> Vec<&'static str> {
    UpdateType::all()
        .filter(|t| mask & t.bit() != 0 && !t.is_internal_only())
        .map(|t| t.as_str())
        .collect()
}

// ─── Wire envelope ──────────────────────────────────────────────────────────

/// Clients rely on update ids wrapping at 2^31.
pub fn mask_update_id(id: i64) -> i32 {
    (id & 0x7fff_ffff) as i32
}

/// Splice the update id into a stored `{"<kind>": {...}}` payload:
/// `{"update_id":N,"<kind>":{...}}`.  The stored body is passed through
/// verbatim.
pub fn encode_update_json(update_id: i32, payload: &str) -> String {
    let trimmed = payload.trim();
    let inner = trimmed
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or("")
        .trim();
    if inner.is_empty() {
        format!("{{\"update_id\":{update_id}}}")
    } else {
        format!("{{\"update_id\":{update_id},{inner}}}")
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mask_excludes_opt_in_kinds() {
        assert_eq!(DEFAULT_ALLOWED_UPDATE_TYPES & UpdateType::ChatMember.bit(), 0);
        assert_eq!(
            DEFAULT_ALLOWED_UPDATE_TYPES & UpdateType::MessageReaction.bit(),
            0
        );
        assert_ne!(DEFAULT_ALLOWED_UPDATE_TYPES & UpdateType::Message.bit(), 0);
        assert_ne!(
            DEFAULT_ALLOWED_UPDATE_TYPES & UpdateType::CallbackQuery.bit(),
            0
        );
    }

    #[test]
    fn name_roundtrip() {
        for update_type in UpdateType::all() {
            assert_eq!(
                UpdateType::from_str(update_type.as_str()),
                Some(update_type)
            );
        }
        assert_eq!(UpdateType::from_str("no_such_kind"), None);
    }

    #[test]
    fn parse_mask_basic() {
        let mask = parse_allowed_updates(r#"["message","callback_query"]"#, false);
        assert_eq!(
            mask,
            UpdateType::Message.bit() | UpdateType::CallbackQuery.bit()
        );
    }

    #[test]
    fn parse_mask_ignores_unknown_and_internal() {
        let mask = parse_allowed_updates(r#"["message","bogus","custom_event"]"#, false);
        assert_eq!(mask, UpdateType::Message.bit());

        let mask = parse_allowed_updates(r#"["custom_event"]"#, true);
        assert_eq!(mask, UpdateType::CustomEvent.bit());
    }

    #[test]
    fn parse_mask_defaults() {
        assert_eq!(
            parse_allowed_updates("", false),
            DEFAULT_ALLOWED_UPDATE_TYPES
        );
        assert_eq!(
            parse_allowed_updates("[]", false),
            DEFAULT_ALLOWED_UPDATE_TYPES
        );
        assert_eq!(
            parse_allowed_updates("not json", false),
            DEFAULT_ALLOWED_UPDATE_TYPES
        );
    }

    #[test]
    fn internal_numeric_mask() {
        let mask = parse_allowed_updates("5", true);
        assert_eq!(mask, 5);
        // From the outside a bare number is not a valid list.
        assert_eq!(
            parse_allowed_updates("5", false),
            DEFAULT_ALLOWED_UPDATE_TYPES
        );
    }

    #[test]
    fn envelope_splice() {
        let body = r#"{"message":{"text":"hi"}}"#;
        assert_eq!(
            encode_update_json(7, body),
            r#"{"update_id":7,"message":{"text":"hi"}}"#
        );
        let parsed: serde_json::Value = serde_json::from_str(&encode_update_json(7, body)).unwrap();
        assert_eq!(parsed["update_id"], 7);
        assert_eq!(parsed["message"]["text"], "hi");
    }

    #[test]
    fn envelope_empty_payload() {
        assert_eq!(encode_update_json(3, "{}"), r#"{"update_id":3}"#);
    }

    #[test]
    fn id_mask_wraps() {
        assert_eq!(mask_update_id(5), 5);
        assert_eq!(mask_update_id(0x8000_0005), 5);
        assert_eq!(mask_update_id(0x7fff_ffff), 0x7fff_ffff);
    }
}
