//! Transport start/stop through the engine.

use cloudlink::error::TransportError;
use cloudlink::{AgentEvent, LinkState, StopBehavior, Timeout, Transport};

use crate::support::{WAIT, config, full_config, start_idle, wait_until};

#[test]
fn start_and_stop_follow_engine_reports() {
    let h = start_idle(config());
    assert_eq!(h.instance.link_state(Transport::Tcp), LinkState::Down);

    h.instance
        .start_transport(Transport::Tcp, Timeout::Bounded(WAIT))
        .unwrap();
    assert_eq!(h.instance.link_state(Transport::Tcp), LinkState::Up);
    assert!(h.cloud.is_link_up(Transport::Tcp));
    assert_eq!(
        h.instance.start_transport(Transport::Tcp, Timeout::NoWait),
        Err(TransportError::AlreadyStarted)
    );

    h.instance
        .stop_transport(Transport::Tcp, StopBehavior::Graceful)
        .unwrap();
    assert_eq!(h.instance.link_state(Transport::Tcp), LinkState::Down);
    assert_eq!(
        h.instance.stop_transport(Transport::Tcp, StopBehavior::Graceful),
        Err(TransportError::NotStarted)
    );

    let mut events = Vec::new();
    while let Some(e) = h.instance.next_event() {
        events.push(e);
    }
    assert_eq!(
        events,
        vec![
            AgentEvent::Started,
            AgentEvent::TransportUp(Transport::Tcp),
            AgentEvent::TransportDown(Transport::Tcp),
        ]
    );
}

#[test]
fn short_message_transports_need_the_service() {
    let h = start_idle(config());
    assert_eq!(
        h.instance.start_transport(Transport::Udp, Timeout::NoWait),
        Err(TransportError::NotValid)
    );
    assert_eq!(
        h.instance.start_transport(Transport::Sms, Timeout::NoWait),
        Err(TransportError::NotValid)
    );

    let h = start_idle(full_config());
    h.instance
        .start_transport(Transport::Sms, Timeout::Bounded(WAIT))
        .unwrap();
    assert_eq!(h.instance.link_state(Transport::Sms), LinkState::Up);
}

#[test]
fn start_times_out_when_the_engine_never_reports() {
    let h = start_idle(config());
    h.cloud.hold_links(true);
    assert_eq!(
        h.instance.start_transport(Transport::Tcp, Timeout::millis(20)),
        Err(TransportError::TimedOut)
    );
    assert_eq!(h.instance.link_state(Transport::Tcp), LinkState::Starting);
    assert_eq!(
        h.instance.start_transport(Transport::Tcp, Timeout::NoWait),
        Err(TransportError::AlreadyStarted)
    );

    h.cloud.hold_links(false);
    assert!(wait_until(|| h.instance.link_state(Transport::Tcp) == LinkState::Up));
    assert!(h.cloud.is_link_up(Transport::Tcp));
}

#[test]
fn stopped_instance_has_no_transports() {
    let h = start_idle(config());
    h.instance.stop(StopBehavior::Graceful).unwrap();
    assert_eq!(
        h.instance.start_transport(Transport::Tcp, Timeout::NoWait),
        Err(TransportError::NotRunning)
    );
    assert_eq!(h.instance.link_state(Transport::Tcp), LinkState::Down);
}
