//! Service naming rules.
//!
//! Every remote service is keyed by its full name, `name@id`. A short name has
//! no `@id` suffix and must be qualified with the remote endpoint id before it
//! can address anything.
//!
//! This module also owns the topic-to-notification rewrite used to build
//! subscription keys:
//!
//! | topic method        | notification key   |
//! |---------------------|--------------------|
//! | `publishServoEvent` | `onServoEvent`     |
//! | `getMethodMap`      | `onMethodMap`      |
//! | `onState`           | `onState`          |
//! | `registered`        | `onRegistered`     |

/// Separator between a service name and its endpoint id.
pub const ID_SEPARATOR: char = '@';

/// Outcome of resolving a possibly short name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resolved {
    /// Canonical `name@id` form.
    Full(String),
    /// A short name that could not be qualified yet.
    Unresolved(String),
}

impl Resolved {
    pub fn as_str(&self) -> &str {
        match self {
            Resolved::Full(name) | Resolved::Unresolved(name) => name,
        }
    }

    pub fn into_string(self) -> String {
        match self {
            Resolved::Full(name) | Resolved::Unresolved(name) => name,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Resolved::Full(_))
    }
}

impl std::fmt::Display for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true if `name` already carries an `@id` suffix.
pub fn is_full_name(name: &str) -> bool {
    name.contains(ID_SEPARATOR)
}

/// Strip the `@id` suffix, if any.
pub fn short_name(name: &str) -> &str {
    match name.find(ID_SEPARATOR) {
        Some(pos) => &name[..pos],
        None => name,
    }
}

/// The id part of a full name.
pub fn id_of(name: &str) -> Option<&str> {
    name.find(ID_SEPARATOR).map(|pos| &name[pos + 1..])
}

/// Qualify `name` with `id` unless it is already a full name.
pub fn full_name_of(name: &str, id: &str) -> String {
    if is_full_name(name) {
        name.to_string()
    } else {
        format!("{}{}{}", name, ID_SEPARATOR, id)
    }
}

/// Resolve `name` against the remote endpoint id.
///
/// Full names pass through unchanged, so resolution is idempotent. A short
/// name stays unresolved until the remote id is known.
pub fn resolve(name: &str, remote_id: Option<&str>) -> Resolved {
    if is_full_name(name) {
        return Resolved::Full(name.to_string());
    }
    match remote_id {
        Some(id) => Resolved::Full(full_name_of(name, id)),
        None => Resolved::Unresolved(name.to_string()),
    }
}

/// Rewrite a topic method name into the name of its inbound notification.
///
/// Rules, applied in order:
/// 1. `publishX` becomes `onX`
/// 2. `getX` becomes `onX`
/// 3. a name that already is a notification (`on` + uppercase) is kept
/// 4. anything else becomes `on` + the capitalized name
pub fn callback_name(topic: &str) -> String {
    if let Some(rest) = topic.strip_prefix("publish") {
        return format!("on{}", capitalize(rest));
    }
    if let Some(rest) = topic.strip_prefix("get") {
        return format!("on{}", capitalize(rest));
    }
    if is_notification_name(topic) {
        return topic.to_string();
    }
    format!("on{}", capitalize(topic))
}

/// Returns true for names of the form `onX` with an uppercase `X`.
pub fn is_notification_name(method: &str) -> bool {
    method
        .strip_prefix("on")
        .and_then(|rest| rest.chars().next())
        .map(|c| c.is_uppercase())
        .unwrap_or(false)
}

/// Subscription key for a `(full name, method)` pair.
pub fn name_method_key(full_name: &str, method: &str) -> String {
    format!("{}.{}", full_name, callback_name(method))
}

/// `org.myrobotlab.service.Servo` -> `Servo`
pub fn simple_type_name(type_key: &str) -> &str {
    match type_key.rfind('.') {
        Some(pos) => &type_key[pos + 1..],
        None => type_key,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
