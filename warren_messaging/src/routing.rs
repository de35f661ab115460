//! Evaluation of bindings against a message: the matching half of every
//! exchange type. Binding patterns are parsed once at bind time; matching
//! itself is pure and lock-free over a binding snapshot.

use warren_core::{
    exchange::{Binding, Exchange, ExchangeKind, TopicSegment},
    message::Message,
    methods::{FieldValue, Table},
    queue::QueueName,
};

/// Routes a message over an exchange's current bindings. Returns the target
/// queue names in binding order, each at most once no matter how many
/// bindings match it.
pub fn route_message(exchange: &Exchange, message: &Message) -> Vec<QueueName> {
    let bindings = exchange.bindings();
    let mut matched: Vec<QueueName> = Vec::new();

    for binding in &bindings {
        if binding_matches(exchange.kind, binding, message) && !matched.contains(&binding.queue) {
            matched.push(binding.queue.clone());
        }
    }

    matched
}

fn binding_matches(kind: ExchangeKind, binding: &Binding, message: &Message) -> bool {
    match kind {
        // 3.1.3.1 - routing-key = routing-key
        ExchangeKind::Direct => binding.routing_key == message.routing_key,
        // 3.1.3.2 - unconditionally
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => topic_matches(&binding.pattern, &message.routing_key),
        ExchangeKind::Headers => {
            headers_match(&binding.arguments, message.properties.headers.as_ref())
        }
    }
}

/// Matches a routing key against a parsed topic pattern.
///
/// `*` consumes exactly one word, `#` zero or more. The walk keeps the
/// position of the most recent `#` and falls back to it when a later
/// segment mismatches, letting the `#` absorb one more word per retry.
pub fn topic_matches(pattern: &[TopicSegment], routing_key: &str) -> bool {
    let key: Vec<&str> = routing_key.split('.').collect();

    let mut p = 0;
    let mut k = 0;
    let mut fallback: Option<(usize, usize)> = None;

    while k < key.len() {
        match pattern.get(p) {
            Some(TopicSegment::Word(word)) if word == key[k] => {
                p += 1;
                k += 1;
            }
            Some(TopicSegment::SingleWildcard) => {
                p += 1;
                k += 1;
            }
            Some(TopicSegment::MultiWildcard) => {
                fallback = Some((p + 1, k));
                p += 1;
            }
            _ => match fallback.take() {
                Some((after_hash, consumed)) => {
                    p = after_hash;
                    k = consumed + 1;
                    fallback = Some((after_hash, consumed + 1));
                }
                None => return false,
            },
        }
    }

    // Remaining pattern may only be `#`s, which match zero words.
    while let Some(TopicSegment::MultiWildcard) = pattern.get(p) {
        p += 1;
    }
    p == pattern.len()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadersMatchMode {
    All,
    Any,
}

/// Evaluates a headers-exchange binding: every binding argument not in the
/// `x-` namespace must be present with an equal value (`x-match` = `all`,
/// the default), or at least one must (`x-match` = `any`).
pub fn headers_match(arguments: &Table, headers: Option<&Table>) -> bool {
    let mode = match arguments.get("x-match").and_then(FieldValue::as_str) {
        Some("any") => HeadersMatchMode::Any,
        _ => HeadersMatchMode::All,
    };

    let mut required = arguments
        .iter()
        .filter(|(name, _)| !name.starts_with("x-"))
        .peekable();

    if required.peek().is_none() {
        // No constraints: `all` vacuously holds, `any` can never.
        return mode == HeadersMatchMode::All;
    }

    let lookup = |name: &str| headers.and_then(|table| table.get(name));
    match mode {
        HeadersMatchMode::All => required.all(|(name, value)| lookup(name) == Some(value)),
        HeadersMatchMode::Any => required.any(|(name, value)| lookup(name) == Some(value)),
    }
}
