// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routing keys.
//!
//! Segments are joined with `.`, so any `.` inside a segment becomes `-`.
//! Request keys are `system.version.instance[.clone]`; admin keys carry an
//! `admin` prefix and an admin queue binds every prefix of its full key, so
//! a probe sent to `admin` or `admin.echo` reaches every matching instance.

/// Prefix of every admin routing key and admin queue name.
pub const ADMIN_PREFIX: &str = "admin";

/// Replaces dots within a segment.
pub fn dash(segment: &str) -> String {
    segment.replace('.', "-")
}

fn segments(system: &str, version: &str, instance: &str, clone_id: Option<&str>) -> Vec<String> {
    let mut parts = vec![dash(system), dash(version), dash(instance)];
    if let Some(clone_id) = clone_id {
        parts.push(dash(clone_id));
    }
    parts
}

/// Request routing key, also the request queue name.
pub fn request_key(system: &str, version: &str, instance: &str) -> String {
    segments(system, version, instance, None).join(".")
}

/// Keys a request queue binds: the instance key and, for clones, the
/// clone-specific key.
pub fn request_binding_keys(
    system: &str,
    version: &str,
    instance: &str,
    clone_id: Option<&str>,
) -> Vec<String> {
    let mut keys = vec![request_key(system, version, instance)];
    if clone_id.is_some() {
        keys.push(segments(system, version, instance, clone_id).join("."));
    }
    keys
}

/// Most specific admin key for an instance.
pub fn admin_key(system: &str, version: &str, instance: &str, clone_id: Option<&str>) -> String {
    let mut parts = vec![ADMIN_PREFIX.to_string()];
    parts.extend(segments(system, version, instance, clone_id));
    parts.join(".")
}

/// Every prefix of [`admin_key`], shortest first. An admin queue binds all
/// of them.
pub fn admin_binding_keys(
    system: &str,
    version: &str,
    instance: &str,
    clone_id: Option<&str>,
) -> Vec<String> {
    let mut keys = Vec::new();
    let mut current = ADMIN_PREFIX.to_string();
    keys.push(current.clone());
    for segment in segments(system, version, instance, clone_id) {
        current = format!("{current}.{segment}");
        keys.push(current.clone());
    }
    keys
}

/// Admin queue name: the admin key plus a random suffix so restarts never
/// collide with a queue still draining.
pub fn admin_queue_name(system: &str, version: &str, instance: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}.{}",
        admin_key(system, version, instance, None),
        &suffix[..8]
    )
}

/// AMQP topic match: `*` is one word, `#` is zero or more words.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}
