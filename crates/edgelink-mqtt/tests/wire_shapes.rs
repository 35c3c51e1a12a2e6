//! Wire-compatibility checks: the exact credential and topic literals
//! the platform (and its C SDK peers) expect.

use edgelink_mqtt::credentials::{dynreg_credentials, mqtt_credentials, AuthType};
use edgelink_mqtt::topics;

#[test]
fn cold_start_credentials_match_platform_expectations() {
    // Config host=h, PK=A, DN=b, DS=s, TLS off => securemode=3.
    let creds = mqtt_credentials("A", "b", "s", "3");
    assert_eq!(
        creds.client_id,
        "A.b|timestamp=2524608000000,_ss=1,_v=sdk-go-4.2.0,securemode=3,signmethod=hmacsha256,ext=3,_conn=tl|"
    );
    assert_eq!(creds.username, "b&A");
    // Deterministic: a rerun yields the identical triple.
    assert_eq!(mqtt_credentials("A", "b", "s", "3"), creds);
}

#[test]
fn thing_model_topic_family() {
    assert_eq!(topics::property_post("A", "b"), "$SYS/A/b/property/post");
    assert_eq!(topics::property_set("A", "b"), "$SYS/A/b/property/set");
    assert_eq!(
        topics::property_set_reply("A", "b"),
        "$SYS/A/b/property/set/reply"
    );
    assert_eq!(topics::event_post("A", "b"), "$SYS/A/b/event/post");
    assert_eq!(
        topics::legacy_property_set("A", "b"),
        "/sys/A/b/thing/service/property/set"
    );
}

#[test]
fn ota_topic_family() {
    assert_eq!(topics::ota_inform("A", "b"), "/ota/device/inform/A/b");
    assert_eq!(topics::ota_progress("A", "b"), "/ota/device/progress/A/b");
    assert_eq!(topics::ota_upgrade("A", "b"), "/ota/device/upgrade/A/b");
    assert_eq!(
        topics::firmware_get_reply("A", "b"),
        "/sys/A/b/thing/ota/firmware/get_reply"
    );
}

#[test]
fn rrpc_request_and_response_correlate_by_topic_tail() {
    let filter = topics::rrpc_request_filter("A", "b");
    let request = topics::rrpc_request("A", "b", "R1");
    let response = topics::rrpc_response("A", "b", "R1");

    assert!(topics::matches_filter(&filter, &request));
    assert!(!topics::matches_filter(&filter, &response));
    assert_eq!(response, "/sys/A/b/rrpc/response/R1");
}

#[test]
fn dynreg_credentials_differ_from_steady_state() {
    let steady = mqtt_credentials("pk", "dn", "secret", "2");
    let dynreg = dynreg_credentials("pk", "dn", "secret", "424242", AuthType::Register);

    // Identity order flips and the nonce replaces the fixed timestamp.
    assert!(steady.client_id.starts_with("pk.dn|"));
    assert!(dynreg.client_id.starts_with("dn.pk|"));
    assert!(dynreg.client_id.contains("random=424242"));
    assert!(!dynreg.client_id.contains("timestamp="));

    // Same username shape, different digest case.
    assert_eq!(steady.username, dynreg.username);
    assert!(steady.password.chars().all(|c| !c.is_ascii_uppercase()));
    assert!(dynreg.password.chars().all(|c| !c.is_ascii_lowercase()));
}
