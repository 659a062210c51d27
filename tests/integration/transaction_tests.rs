//! Outbound transactions: send_data, ping, timeouts and late completions.

use std::sync::Arc;

use cloudlink::engine::{Action, CompletionStatus};
use cloudlink::error::ActionError;
use cloudlink::{ResourceKind, SendData, StopBehavior, Timeout, Transport};
use miniz_oxide::inflate::decompress_to_vec;

use crate::support::{WAIT, config, full_config, start, start_idle, wait_until};

#[test]
fn send_data_returns_the_cloud_response() {
    let h = start(config());
    let reply = h
        .instance
        .send_data(SendData::new("telemetry/temp", b"21.5".to_vec()), Timeout::Bounded(WAIT))
        .unwrap();
    assert_eq!(reply.response, b"21.5");
    assert_eq!(h.instance.pending_transactions(), 0);
    assert_eq!(h.audit.live(ResourceKind::Transaction), 0);
}

#[test]
fn compressed_upload_inflates_to_the_original() {
    let h = start(config());
    let payload = b"sensor,sensor,sensor,sensor,sensor,sensor,sensor".to_vec();
    let mut data = SendData::new("telemetry/bulk", payload.clone());
    data.compress = true;
    data.content_type = Some("text/csv".into());
    h.instance.send_data(data, Timeout::Bounded(WAIT)).unwrap();

    let sent = h
        .cloud
        .actions()
        .into_iter()
        .find_map(|a| match a {
            Action::SendData(d) => Some(d),
            _ => None,
        })
        .unwrap();
    assert!(sent.compressed);
    assert!(sent.payload.len() < payload.len());
    assert_eq!(decompress_to_vec(&sent.payload).unwrap(), payload);
    assert_eq!(sent.content_type.as_deref(), Some("text/csv"));
}

#[test]
fn zero_timeout_survives_a_late_completion() {
    let h = start(config());
    h.cloud.hold_completions();

    let result = h
        .instance
        .send_data(SendData::new("late", b"x".to_vec()), Timeout::NoWait);
    assert_eq!(result.err(), Some(ActionError::TimedOut));
    assert_eq!(h.instance.pending_transactions(), 1);
    assert_eq!(h.cloud.pending_completions(), 1);
    assert_eq!(h.audit.live(ResourceKind::Transaction), 1);

    h.cloud.release_held(CompletionStatus::Success);
    assert!(wait_until(|| h.instance.pending_transactions() == 0));
    assert!(wait_until(|| h.audit.live(ResourceKind::Transaction) == 0));

    // The instance is still healthy afterwards.
    let reply = h
        .instance
        .send_data(SendData::new("after", b"y".to_vec()), Timeout::Bounded(WAIT))
        .unwrap();
    assert_eq!(reply.response, b"y");
}

#[test]
fn bounded_timeout_expires() {
    let h = start(config());
    h.cloud.hold_completions();
    let result = h
        .instance
        .send_data(SendData::new("slow", b"x".to_vec()), Timeout::millis(20));
    assert_eq!(result.err(), Some(ActionError::TimedOut));
}

#[test]
fn failure_status_is_surfaced() {
    let h = start(config());
    h.cloud.release_held(CompletionStatus::Error(5));
    let result = h
        .instance
        .send_data(SendData::new("bad", b"x".to_vec()), Timeout::Bounded(WAIT));
    assert_eq!(result.err(), Some(ActionError::Failed(CompletionStatus::Error(5))));
}

#[test]
fn stop_cancels_waiting_callers() {
    let h = start(config());
    h.cloud.hold_completions();

    let instance = Arc::new(h.instance);
    let caller = {
        let instance = Arc::clone(&instance);
        std::thread::spawn(move || {
            instance.send_data(SendData::new("never", b"x".to_vec()), Timeout::Infinite)
        })
    };
    assert!(wait_until(|| instance.pending_transactions() == 1));

    instance.stop(StopBehavior::Immediate).unwrap();
    assert_eq!(caller.join().unwrap().err(), Some(ActionError::Cancelled));
    assert_eq!(h.audit.total_live(), 0);
}

#[test]
fn send_data_checks_service_and_transport() {
    let mut c = config();
    c.services.data = None;
    let h = start(c);
    let result = h
        .instance
        .send_data(SendData::new("p", b"x".to_vec()), Timeout::NoWait);
    assert_eq!(result.err(), Some(ActionError::ServiceDisabled));

    let h = start_idle(config());
    let result = h
        .instance
        .send_data(SendData::new("p", b"x".to_vec()), Timeout::NoWait);
    assert_eq!(result.err(), Some(ActionError::TransportNotStarted));
}

#[test]
fn ping_needs_a_started_short_message_transport() {
    let h = start(full_config());
    assert_eq!(
        h.instance.ping(Transport::Tcp, true, Timeout::NoWait),
        Err(ActionError::TransportNotValid)
    );
    assert_eq!(
        h.instance.ping(Transport::Udp, true, Timeout::NoWait),
        Err(ActionError::TransportNotStarted)
    );

    h.instance
        .start_transport(Transport::Udp, Timeout::Bounded(WAIT))
        .unwrap();
    assert_eq!(h.instance.ping(Transport::Udp, true, Timeout::Bounded(WAIT)), Ok(()));
    assert!(h.cloud.actions().iter().any(|a| matches!(a, Action::Ping { transport: Transport::Udp, .. })));

    let h = start(config());
    assert_eq!(
        h.instance.ping(Transport::Sms, false, Timeout::NoWait),
        Err(ActionError::TransportNotValid)
    );
}
