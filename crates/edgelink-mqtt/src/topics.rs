//! Topic construction and MQTT filter matching.
//!
//! The Thing-Model topics come in two shapes: the primary `$SYS`
//! namespace and a legacy `/sys/.../thing/...` form some brokers expect.
//! Subscribers try the primary shape first and fall back to legacy.

/// Property post (device → cloud).
pub fn property_post(pk: &str, dn: &str) -> String {
    format!("$SYS/{pk}/{dn}/property/post")
}

pub fn property_post_reply(pk: &str, dn: &str) -> String {
    format!("$SYS/{pk}/{dn}/property/post/reply")
}

/// Property set (cloud → device).
pub fn property_set(pk: &str, dn: &str) -> String {
    format!("$SYS/{pk}/{dn}/property/set")
}

pub fn property_set_reply(pk: &str, dn: &str) -> String {
    format!("$SYS/{pk}/{dn}/property/set/reply")
}

pub fn event_post(pk: &str, dn: &str) -> String {
    format!("$SYS/{pk}/{dn}/event/post")
}

pub fn event_post_reply(pk: &str, dn: &str) -> String {
    format!("$SYS/{pk}/{dn}/event/post/reply")
}

/// Filter matching every service invocation for the device.
pub fn service_invoke_filter(pk: &str, dn: &str) -> String {
    format!("$SYS/{pk}/{dn}/service/+/invoke")
}

pub fn service_invoke_reply(pk: &str, dn: &str, service: &str) -> String {
    format!("$SYS/{pk}/{dn}/service/{service}/invoke/reply")
}

/// Legacy property-set topic tried when the `$SYS` subscribe is refused.
pub fn legacy_property_set(pk: &str, dn: &str) -> String {
    format!("/sys/{pk}/{dn}/thing/service/property/set")
}

/// Legacy service filter tried when the `$SYS` subscribe is refused.
pub fn legacy_service_filter(pk: &str, dn: &str) -> String {
    format!("/sys/{pk}/{dn}/thing/service/+")
}

/// Legacy reply topic used when a response names no service.
pub fn legacy_service_reply(pk: &str, dn: &str) -> String {
    format!("/sys/{pk}/{dn}/thing/service/property/set_reply")
}

pub fn rrpc_request_filter(pk: &str, dn: &str) -> String {
    format!("/sys/{pk}/{dn}/rrpc/request/+")
}

pub fn rrpc_request_prefix(pk: &str, dn: &str) -> String {
    format!("/sys/{pk}/{dn}/rrpc/request/")
}

pub fn rrpc_request(pk: &str, dn: &str, request_id: &str) -> String {
    format!("/sys/{pk}/{dn}/rrpc/request/{request_id}")
}

pub fn rrpc_response(pk: &str, dn: &str, request_id: &str) -> String {
    format!("/sys/{pk}/{dn}/rrpc/response/{request_id}")
}

pub fn ota_inform(pk: &str, dn: &str) -> String {
    format!("/ota/device/inform/{pk}/{dn}")
}

pub fn ota_progress(pk: &str, dn: &str) -> String {
    format!("/ota/device/progress/{pk}/{dn}")
}

pub fn ota_upgrade(pk: &str, dn: &str) -> String {
    format!("/ota/device/upgrade/{pk}/{dn}")
}

pub fn firmware_get(pk: &str, dn: &str) -> String {
    format!("/sys/{pk}/{dn}/thing/ota/firmware/get")
}

pub fn firmware_get_reply(pk: &str, dn: &str) -> String {
    format!("/sys/{pk}/{dn}/thing/ota/firmware/get_reply")
}

pub fn dynreg_response(pk: &str, dn: &str) -> String {
    format!("/ext/register/{pk}/{dn}")
}

/// MQTT topic-filter matching.
///
/// `+` matches exactly one segment; `#` is valid only as the final
/// segment and matches zero or more remaining segments; anything else
/// matches literally. The session routes each inbound message to every
/// stored filter that matches, so wildcard subscriptions (RRPC, OTA)
/// work on client libraries that only dispatch by exact topic.
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    let filter_segs: Vec<&str> = filter.split('/').collect();
    let topic_segs: Vec<&str> = topic.split('/').collect();

    for (i, seg) in filter_segs.iter().enumerate() {
        match *seg {
            "#" => return i == filter_segs.len() - 1,
            "+" => {
                if i >= topic_segs.len() {
                    return false;
                }
            }
            literal => {
                if i >= topic_segs.len() || literal != topic_segs[i] {
                    return false;
                }
            }
        }
    }
    filter_segs.len() == topic_segs.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thing_model_topics() {
        assert_eq!(property_post("A", "b"), "$SYS/A/b/property/post");
        assert_eq!(property_set_reply("A", "b"), "$SYS/A/b/property/set/reply");
        assert_eq!(
            service_invoke_filter("A", "b"),
            "$SYS/A/b/service/+/invoke"
        );
        assert_eq!(
            service_invoke_reply("A", "b", "toggle_door"),
            "$SYS/A/b/service/toggle_door/invoke/reply"
        );
    }

    #[test]
    fn test_ota_and_rrpc_topics() {
        assert_eq!(ota_inform("A", "b"), "/ota/device/inform/A/b");
        assert_eq!(firmware_get("A", "b"), "/sys/A/b/thing/ota/firmware/get");
        assert_eq!(rrpc_request_filter("A", "b"), "/sys/A/b/rrpc/request/+");
        assert_eq!(rrpc_response("A", "b", "R1"), "/sys/A/b/rrpc/response/R1");
        assert_eq!(dynreg_response("A", "b"), "/ext/register/A/b");
    }

    #[test]
    fn test_exact_match() {
        assert!(matches_filter("a/b/c", "a/b/c"));
        assert!(!matches_filter("a/b/c", "a/b"));
        assert!(!matches_filter("a/b", "a/b/c"));
        assert!(!matches_filter("a/b/c", "a/b/x"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches_filter("a/+/c", "a/b/c"));
        assert!(matches_filter("+/+/+", "a/b/c"));
        assert!(!matches_filter("a/+", "a"));
        assert!(!matches_filter("a/+", "a/b/c"));
        assert!(matches_filter(
            "/sys/A/b/rrpc/request/+",
            "/sys/A/b/rrpc/request/R1"
        ));
        assert!(!matches_filter(
            "/sys/A/b/rrpc/request/+",
            "/sys/A/b/rrpc/response/R1"
        ));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches_filter("a/#", "a/b"));
        assert!(matches_filter("a/#", "a/b/c/d"));
        // `#` matches zero remaining segments.
        assert!(matches_filter("a/#", "a"));
        assert!(matches_filter("#", "anything/at/all"));
        // `#` is only valid as the last segment.
        assert!(!matches_filter("a/#/c", "a/b/c"));
    }

    #[test]
    fn test_service_invoke_filter_matches() {
        let filter = service_invoke_filter("A", "b");
        assert!(matches_filter(&filter, "$SYS/A/b/service/toggle_door/invoke"));
        assert!(!matches_filter(
            &filter,
            "$SYS/A/b/service/toggle_door/invoke/reply"
        ));
    }
}
