//! Shared fixtures: configurations, an audited instance and polling helpers.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cloudlink::config::{
    CommandConfig, DataConfig, FileSystemConfig, FirmwareConfig, FirmwareTarget,
    RemoteConfigConfig, ShortMessageConfig,
};
use cloudlink::{
    AuditPlatform, HandlerResult, InboundRequest, Instance, LoopbackCloud, StartConfig, Timeout,
    Transport, loopback,
};

pub const DEVICE_ID: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x40, 0x9d, 0x01];
pub const WAIT: Duration = Duration::from_secs(5);

/// Command, data and remote configuration enabled.
pub fn config() -> StartConfig {
    let mut c = StartConfig::new(0x0300_0000, DEVICE_ID, "test-device", "edp.example.net");
    c.services.command = Some(CommandConfig::default());
    c.services.data = Some(DataConfig::default());
    c.services.remote_config = Some(RemoteConfigConfig::default());
    c
}

/// Every service enabled, including firmware, file system and UDP/SMS.
pub fn full_config() -> StartConfig {
    let mut c = config();
    c.services.firmware = Some(FirmwareConfig {
        targets: vec![FirmwareTarget {
            version: [1, 2, 0, 0],
            description: "application".into(),
            filespec: ".*\\.bin".into(),
            maximum_size: 1024,
        }],
    });
    c.services.file_system = Some(FileSystemConfig::default());
    c.services.short_message = Some(ShortMessageConfig { udp: true, sms: true });
    c
}

pub struct Harness {
    pub instance: Instance,
    pub cloud: LoopbackCloud,
    pub audit: Arc<AuditPlatform>,
}

/// Start on an audited platform without bringing any transport up.
pub fn start_idle(config: StartConfig) -> Harness {
    let audit = Arc::new(AuditPlatform::new());
    let (engine, cloud) = loopback();
    let instance = Instance::start_with(config, engine, audit.clone()).unwrap();
    Harness {
        instance,
        cloud,
        audit,
    }
}

/// Start and bring TCP up.
pub fn start(config: StartConfig) -> Harness {
    let h = start_idle(config);
    h.instance
        .start_transport(Transport::Tcp, Timeout::Bounded(WAIT))
        .unwrap();
    h
}

pub fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    done()
}

/// Handler that answers every request with `reply`.
pub fn replying(reply: &'static [u8]) -> impl Fn(&InboundRequest) -> HandlerResult + Send + Sync + 'static {
    move |_| Ok(reply.to_vec())
}

/// Records every payload a handler sees.
#[derive(Clone, Default)]
pub struct Seen(pub Arc<Mutex<Vec<Vec<u8>>>>);

impl Seen {
    pub fn push(&self, payload: &[u8]) {
        self.0.lock().unwrap().push(payload.to_vec());
    }

    pub fn all(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }
}

/// Fresh scratch directory under the system temp dir.
pub fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("cloudlink-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn is_under(path: &Path, dir: &Path) -> bool {
    path.starts_with(dir)
}
