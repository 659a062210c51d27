//! Inbound sessions: admission, fragmentation, single-flight and cancel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use cloudlink::config::{CommandConfig, DataConfig};
use cloudlink::error::{HandlerError, RegisterError, SessionError};
use cloudlink::platform::{Exhausted, ThreadBody};
use cloudlink::{
    AgentEvent, CloudRequest, InboundRequest, Instance, Platform, ReceiveStatus, ResourceKind,
    Service, SharedPlatform, StdPlatform, StopBehavior, Transport,
};

use crate::support::{Seen, WAIT, config, full_config, replying, start, wait_until};

fn recording(seen: &Seen, reply: &'static [u8]) -> impl Fn(&InboundRequest) -> cloudlink::HandlerResult + Send + Sync + 'static {
    let seen = seen.clone();
    move |req| {
        seen.push(&req.payload);
        Ok(reply.to_vec())
    }
}

// ── Basic exchange ───────────────────────────────────────────

#[test]
fn help_command_runs_the_handler_once() {
    let h = start(config());
    let seen = Seen::default();
    h.instance
        .register(Service::Command, recording(&seen, b"commands: help"))
        .unwrap();

    h.cloud.push(CloudRequest::command("help"));
    let done = h.cloud.wait_for_finished(1, WAIT);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].error, None);
    assert!(!done[0].rejected);
    assert_eq!(done[0].reply, b"commands: help");
    assert_eq!(seen.all(), vec![b"help".to_vec()]);
    assert!(wait_until(|| !h.instance.service_busy(Service::Command)));
}

#[test]
fn disabled_service_is_rejected_without_a_handler() {
    let mut c = config();
    c.services.remote_config = None;
    let h = start(c);

    h.cloud.push(CloudRequest::remote_config(b"<set/>".to_vec()));
    let done = h.cloud.wait_for_finished(1, WAIT);
    assert!(done[0].rejected);
    assert_eq!(done[0].error, Some(SessionError::ServiceDisabled));

    let mut events = Vec::new();
    while let Some(e) = h.instance.next_event() {
        events.push(e);
    }
    assert!(events.contains(&AgentEvent::SessionRejected {
        service: Service::RemoteConfig,
        reason: SessionError::ServiceDisabled,
    }));
}

#[test]
fn split_delivery_matches_single_delivery() {
    let h = start(config());
    let seen = Seen::default();
    h.instance
        .register(Service::Command, recording(&seen, b"ok"))
        .unwrap();

    h.cloud
        .push(CloudRequest::command("").fragments([&b"12345"[..], &b"67890"[..]]));
    h.cloud.push(CloudRequest::command("1234567890"));
    let done = h.cloud.wait_for_finished(2, WAIT);
    assert_eq!(done.len(), 2);
    assert_eq!(seen.all(), vec![b"1234567890".to_vec(), b"1234567890".to_vec()]);
}

#[test]
fn empty_final_fragment_still_completes() {
    let h = start(config());
    let seen = Seen::default();
    h.instance
        .register(Service::Command, recording(&seen, b"empty"))
        .unwrap();

    h.cloud.push(CloudRequest::command(""));
    let done = h.cloud.wait_for_finished(1, WAIT);
    assert_eq!(done[0].reply, b"empty");
    assert_eq!(seen.all(), vec![Vec::<u8>::new()]);
}

#[test]
fn reply_is_skipped_when_not_required() {
    let h = start(config());
    h.instance
        .register(Service::Command, replying(b"ignored"))
        .unwrap();

    h.cloud.push(CloudRequest::command("fire").without_reply());
    let done = h.cloud.wait_for_finished(1, WAIT);
    assert!(done[0].reply.is_empty());
    assert_eq!(done[0].error, None);
    assert!(wait_until(|| !h.instance.service_busy(Service::Command)));
}

#[test]
fn long_replies_stream_in_pieces() {
    let h = start(config());
    h.instance
        .register(Service::Command, |_: &InboundRequest| -> cloudlink::HandlerResult {
            Ok(vec![b'x'; 1000])
        })
        .unwrap();

    h.cloud.push(CloudRequest::command("dump"));
    let done = h.cloud.wait_for_finished(1, WAIT);
    assert_eq!(done[0].reply.len(), 1000);
}

// ── Handler failures ─────────────────────────────────────────

#[test]
fn handler_error_is_sent_back_as_text() {
    let h = start(config());
    h.instance
        .register(Service::Command, |_: &InboundRequest| -> cloudlink::HandlerResult {
            Err(HandlerError::new(7, "unknown command"))
        })
        .unwrap();

    h.cloud.push(CloudRequest::command("reboot"));
    let done = h.cloud.wait_for_finished(1, WAIT);
    assert_eq!(
        done[0].error,
        Some(SessionError::Handler(HandlerError::new(7, "unknown command")))
    );
    assert_eq!(done[0].reply, b"handler: error 7: unknown command");
}

#[test]
fn missing_handler_is_reported() {
    let h = start(config());
    h.cloud.push(CloudRequest::command("help"));
    let done = h.cloud.wait_for_finished(1, WAIT);
    assert_eq!(done[0].error, Some(SessionError::NoHandler));
    assert_eq!(done[0].reply, b"no handler registered");
}

#[test]
fn panicking_handler_does_not_wedge_the_service() {
    let h = start(config());
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    h.instance
        .register(Service::Command, move |_: &InboundRequest| -> cloudlink::HandlerResult {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first call fails");
            }
            Ok(b"recovered".to_vec())
        })
        .unwrap();

    h.cloud.push(CloudRequest::command("a"));
    h.cloud.push(CloudRequest::command("b"));
    let done = h.cloud.wait_for_finished(2, WAIT);
    assert!(matches!(done[0].error, Some(SessionError::Handler(_))));
    assert_eq!(done[1].reply, b"recovered");
}

// ── Single flight ────────────────────────────────────────────

#[test]
fn second_request_waits_for_the_first() {
    let h = start(config());
    let release = Arc::new(AtomicBool::new(false));
    let seen = Seen::default();
    let (r, s) = (Arc::clone(&release), seen.clone());
    h.instance
        .register(Service::Command, move |req: &InboundRequest| -> cloudlink::HandlerResult {
            s.push(&req.payload);
            if req.payload == b"slow" {
                while !r.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            Ok(req.payload.clone())
        })
        .unwrap();

    h.cloud.push(CloudRequest::command("slow"));
    h.cloud.push(CloudRequest::command("fast"));
    assert!(wait_until(|| seen.all().len() == 1));
    std::thread::sleep(Duration::from_millis(20));
    assert!(h.instance.service_busy(Service::Command));
    assert!(h.cloud.finished().is_empty(), "nothing finishes while the slot is held");
    assert_eq!(seen.all().len(), 1, "second handler must not start early");

    release.store(true, Ordering::SeqCst);
    let done = h.cloud.wait_for_finished(2, WAIT);
    assert_eq!(done[0].reply, b"slow");
    assert_eq!(done[1].reply, b"fast");
    assert!(done[1].busy_before_admission > 0);
    assert_eq!(seen.all(), vec![b"slow".to_vec(), b"fast".to_vec()]);
}

#[test]
fn services_run_independently() {
    let h = start(config());
    let release = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&release);
    h.instance
        .register(Service::Command, move |_: &InboundRequest| -> cloudlink::HandlerResult {
            while !r.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(b"cmd".to_vec())
        })
        .unwrap();
    h.instance
        .register(Service::RemoteConfig, replying(b"cfg"))
        .unwrap();

    h.cloud.push(CloudRequest::command("block"));
    h.cloud.push(CloudRequest::remote_config(b"get".to_vec()));
    let done = h.cloud.wait_for_finished(1, WAIT);
    assert_eq!(done[0].service, Service::RemoteConfig);

    release.store(true, Ordering::SeqCst);
    assert_eq!(h.cloud.wait_for_finished(2, WAIT).len(), 2);
}

// ── Cancel and limits ────────────────────────────────────────

#[test]
fn cancelled_request_frees_the_slot() {
    let h = start(config());
    let release = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&release);
    h.instance
        .register(Service::Command, move |req: &InboundRequest| -> cloudlink::HandlerResult {
            if req.payload == b"long" {
                while !r.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            Ok(b"done".to_vec())
        })
        .unwrap();

    h.cloud.push(CloudRequest::command("long").cancel_when_queued());
    let done = h.cloud.wait_for_finished(1, WAIT);
    assert!(done[0].cancelled);
    assert!(done[0].reply.is_empty());

    // A handler already running finishes first; its result is discarded.
    release.store(true, Ordering::SeqCst);
    assert!(wait_until(|| !h.instance.service_busy(Service::Command)));

    h.cloud.push(CloudRequest::command("next"));
    let done = h.cloud.wait_for_finished(2, WAIT);
    assert_eq!(done[1].reply, b"done");
}

#[test]
fn oversized_request_is_rejected_and_slot_freed() {
    let mut c = config();
    c.services.command = Some(CommandConfig { max_request_size: 8 });
    let h = start(c);
    h.instance
        .register(Service::Command, replying(b"ok"))
        .unwrap();

    h.cloud.push(CloudRequest::command("0123456789abcdef").split(4));
    let done = h.cloud.wait_for_finished(1, WAIT);
    assert!(done[0].rejected);
    assert_eq!(done[0].error, Some(SessionError::RequestTooLarge));
    assert!(wait_until(|| !h.instance.service_busy(Service::Command)));

    h.cloud.push(CloudRequest::command("small"));
    let done = h.cloud.wait_for_finished(2, WAIT);
    assert_eq!(done[1].reply, b"ok");
}

// ── Data receive targets ─────────────────────────────────────

#[test]
fn receive_targets_route_and_fall_back() {
    let mut c = config();
    c.services.data = Some(DataConfig::default());
    let h = start(c);

    h.instance
        .add_receive_target("echo", |req: &InboundRequest| -> cloudlink::HandlerResult {
            Ok(req.payload.clone())
        }, 64)
        .unwrap();
    assert_eq!(
        h.instance.add_receive_target("echo", replying(b""), 64),
        Err(RegisterError::TargetAlreadyAdded)
    );

    h.cloud.push(CloudRequest::device_request("echo", b"ping".to_vec()));
    h.cloud.push(CloudRequest::device_request("nobody", b"?".to_vec()));
    let done = h.cloud.wait_for_finished(2, WAIT);
    assert_eq!(done[0].reply, b"ping");
    assert!(done[1].rejected);
    assert_eq!(done[1].error, Some(SessionError::TargetNotFound));

    h.instance
        .register(Service::DataReceive, replying(b"fallback"))
        .unwrap();
    h.cloud.push(CloudRequest::device_request("nobody", b"?".to_vec()));
    let done = h.cloud.wait_for_finished(3, WAIT);
    assert_eq!(done[2].reply, b"fallback");

    h.instance.remove_receive_target("echo").unwrap();
    assert_eq!(
        h.instance.remove_receive_target("echo"),
        Err(RegisterError::TargetNotAdded)
    );
}

#[test]
fn receive_target_limit_applies() {
    let h = start(config());
    h.instance
        .add_receive_target("tiny", replying(b"ok"), 4)
        .unwrap();
    h.cloud.push(CloudRequest::device_request("tiny", b"too long".to_vec()));
    let done = h.cloud.wait_for_finished(1, WAIT);
    assert_eq!(done[0].error, Some(SessionError::RequestTooLarge));
}

// ── Receive status ───────────────────────────────────────────

#[derive(Clone, Default)]
struct Statuses(Arc<std::sync::Mutex<Vec<ReceiveStatus>>>);

impl Statuses {
    fn hook(&self) -> impl Fn(&ReceiveStatus) + Send + Sync + 'static {
        let all = Arc::clone(&self.0);
        move |status: &ReceiveStatus| all.lock().unwrap().push(status.clone())
    }

    fn all(&self) -> Vec<ReceiveStatus> {
        self.0.lock().unwrap().clone()
    }
}

#[test]
fn receive_status_reports_each_finished_exchange() {
    let h = start(config());
    let statuses = Statuses::default();
    h.instance
        .add_receive_target_with_status("led", replying(b"done"), statuses.hook(), 4)
        .unwrap();

    h.cloud.push(CloudRequest::device_request("led", b"on".to_vec()));
    h.cloud
        .push(CloudRequest::device_request("led", b"off".to_vec()).without_reply());
    h.cloud.push(CloudRequest::device_request("led", b"blink!".to_vec()));
    h.cloud.wait_for_finished(3, WAIT);
    assert!(wait_until(|| statuses.all().len() == 3));

    let all = statuses.all();
    assert!(all.iter().all(|s| s.target.as_deref() == Some("led")));
    assert!(all.iter().all(|s| s.transport == Transport::Tcp));
    let ok: Vec<usize> = all
        .iter()
        .filter(|s| s.error.is_none())
        .map(|s| s.reply_len)
        .collect();
    assert_eq!(ok.len(), 2);
    assert!(ok.contains(&4), "replied exchange reports its reply size");
    assert!(ok.contains(&0), "exchange without reply reports nothing sent");
    assert!(all.iter().any(|s| s.error == Some(SessionError::RequestTooLarge)));
}

fn exploding(_: &ReceiveStatus) {
    panic!("hook failure");
}

#[test]
fn fallback_handler_uses_the_service_status_hook() {
    let h = start(config());
    let statuses = Statuses::default();
    h.instance
        .register(Service::DataReceive, replying(b"fallback"))
        .unwrap();
    h.instance.set_receive_status(statuses.hook()).unwrap();
    h.instance
        .add_receive_target("quiet", replying(b"ok"), 64)
        .unwrap();

    h.cloud.push(CloudRequest::device_request("quiet", b"x".to_vec()));
    h.cloud.push(CloudRequest::device_request("other", b"x".to_vec()));
    h.cloud.wait_for_finished(2, WAIT);
    assert!(wait_until(|| statuses.all().len() == 1));

    let all = statuses.all();
    assert_eq!(all[0].target.as_deref(), Some("other"));
    assert_eq!(all[0].reply_len, b"fallback".len());
}

#[test]
fn status_hook_panic_does_not_stall_the_engine() {
    let h = start(config());
    h.instance
        .add_receive_target_with_status(
            "boom",
            replying(b"ok"),
            exploding,
            64,
        )
        .unwrap();
    h.cloud.push(CloudRequest::device_request("boom", b"1".to_vec()));
    h.cloud.push(CloudRequest::device_request("boom", b"2".to_vec()));
    let done = h.cloud.wait_for_finished(2, WAIT);
    assert_eq!(done.len(), 2);
    assert!(h.instance.is_running());
}

// ── Firmware ─────────────────────────────────────────────────

#[test]
fn firmware_handler_sees_the_image_digest() {
    let h = start(full_config());
    h.instance
        .register(Service::Firmware, |req: &InboundRequest| -> cloudlink::HandlerResult {
            let image = req.firmware.ok_or_else(|| HandlerError::new(1, "no digest"))?;
            Ok(image.sha256[..4].to_vec())
        })
        .unwrap();

    h.cloud.push(CloudRequest::firmware(0, b"abc".to_vec()).split(1));
    h.cloud.push(CloudRequest::firmware(3, b"abc".to_vec()));
    h.cloud.push(CloudRequest::firmware(0, vec![0u8; 2048]));
    let done = h.cloud.wait_for_finished(3, WAIT);
    assert_eq!(done[0].reply, [0xba, 0x78, 0x16, 0xbf]);
    assert_eq!(done[1].error, Some(SessionError::InvalidFirmwareTarget));
    assert_eq!(done[2].error, Some(SessionError::RequestTooLarge));

    h.instance.stop(StopBehavior::Graceful).unwrap();
    assert_eq!(h.audit.total_live(), 0);
}

// ── Early delivery ───────────────────────────────────────────

/// Holds back every service worker so the engine driver runs first.
struct SlowWorkers {
    inner: StdPlatform,
}

impl Platform for SlowWorkers {
    fn reserve(&self, kind: ResourceKind) -> Result<(), Exhausted> {
        self.inner.reserve(kind)
    }

    fn release(&self, kind: ResourceKind) {
        self.inner.release(kind)
    }

    fn spawn(&self, name: &str, body: ThreadBody) -> std::io::Result<std::thread::JoinHandle<()>> {
        if name == "cl-engine" {
            return self.inner.spawn(name, body);
        }
        self.inner.spawn(
            name,
            Box::new(move || {
                std::thread::sleep(Duration::from_millis(30));
                body()
            }),
        )
    }
}

#[test]
fn request_delivered_before_workers_attach_is_served() {
    let (engine, cloud) = cloudlink::loopback();
    cloud.connect(Transport::Tcp);
    cloud.push(CloudRequest::command("early"));

    let platform: SharedPlatform = Arc::new(SlowWorkers {
        inner: StdPlatform::new(),
    });
    let instance = Instance::start_with(config(), engine, platform).unwrap();

    let done = cloud.wait_for_finished(1, WAIT);
    assert_eq!(done.len(), 1);
    assert!(!done[0].rejected);
    assert!(wait_until(|| !instance.service_busy(Service::Command)));

    instance
        .register(Service::Command, replying(b"late ok"))
        .unwrap();
    cloud.push(CloudRequest::command("second"));
    let done = cloud.wait_for_finished(2, WAIT);
    assert_eq!(done[1].reply, b"late ok");
    instance.stop(StopBehavior::Graceful).unwrap();
}
