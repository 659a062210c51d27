//! Uploads: send behaviors, local files, binary and collected data points.

use cloudlink::engine::{Action, CompletionStatus};
use cloudlink::error::ActionError;
use cloudlink::{
    BinaryDataPoint, BinarySource, DataPoint, DataPointCollection, SendBehavior, SendData,
    SendFile, Timeout, Transport, Value, datapoints::Timestamp,
};

use crate::support::{WAIT, config, full_config, scratch_dir, start};

fn upload(behavior: SendBehavior, payload: &[u8]) -> SendData {
    let mut data = SendData::new("logs/boot.txt", payload.to_vec());
    data.behavior = behavior;
    data
}

// ── Send behavior ────────────────────────────────────────────

#[test]
fn each_upload_carries_its_behavior() {
    let h = start(config());
    let send = |behavior, payload: &[u8]| {
        h.instance
            .send_data(upload(behavior, payload), Timeout::Bounded(WAIT))
            .unwrap();
    };

    send(SendBehavior::Overwrite, b"a");
    send(SendBehavior::Append, b"b");
    assert_eq!(h.cloud.stored("logs/boot.txt").unwrap(), b"ab");

    send(SendBehavior::Archive, b"c");
    assert_eq!(h.cloud.stored("logs/boot.txt").unwrap(), b"c");
    assert_eq!(h.cloud.archived("logs/boot.txt"), vec![b"ab".to_vec()]);

    send(SendBehavior::Overwrite, b"d");
    assert_eq!(h.cloud.stored("logs/boot.txt").unwrap(), b"d");

    let behaviors: Vec<_> = h
        .cloud
        .actions()
        .into_iter()
        .filter_map(|a| match a {
            Action::SendData(d) => Some(d.behavior),
            _ => None,
        })
        .collect();
    assert_eq!(
        behaviors,
        [
            SendBehavior::Overwrite,
            SendBehavior::Append,
            SendBehavior::Archive,
            SendBehavior::Overwrite
        ]
    );
}

#[test]
fn upload_arguments_are_checked_before_anything_is_sent() {
    let h = start(config());
    let cases = [
        (SendData::new("", b"x".to_vec()), ActionError::InvalidCloudPath),
        (SendData::new("p", Vec::new()), ActionError::InvalidData),
        (
            SendData {
                content_type: Some(String::new()),
                ..SendData::new("p", b"x".to_vec())
            },
            ActionError::InvalidContentType,
        ),
        (
            SendData {
                content_type: Some("x".repeat(256)),
                ..SendData::new("p", b"x".to_vec())
            },
            ActionError::InvalidContentType,
        ),
    ];
    for (data, expected) in cases {
        assert_eq!(h.instance.send_data(data, Timeout::NoWait).err(), Some(expected));
    }
    assert!(h.cloud.actions().iter().all(|a| !matches!(a, Action::SendData(_))));
}

// ── Files ────────────────────────────────────────────────────

#[test]
fn send_file_uploads_the_local_content() {
    let h = start(full_config());
    let dir = scratch_dir("send-file");
    let local = dir.join("report.csv");
    std::fs::write(&local, b"t,v\n1,2\n").unwrap();

    let mut file = SendFile::new(&local, "reports/today.csv");
    file.content_type = Some("text/csv".into());
    let reply = h.instance.send_file(file, Timeout::Bounded(WAIT)).unwrap();
    assert_eq!(reply.response, b"t,v\n1,2\n");
    assert_eq!(h.cloud.stored("reports/today.csv").unwrap(), b"t,v\n1,2\n");

    let mut quiet = SendFile::new(&local, "reports/today.csv");
    quiet.response_required = false;
    quiet.behavior = SendBehavior::Append;
    let reply = h.instance.send_file(quiet, Timeout::Bounded(WAIT)).unwrap();
    assert!(reply.response.is_empty());
    assert_eq!(
        h.cloud.stored("reports/today.csv").unwrap(),
        b"t,v\n1,2\nt,v\n1,2\n"
    );
}

#[test]
fn send_file_refuses_what_it_cannot_read() {
    let h = start(full_config());
    let dir = scratch_dir("send-file-errors");
    let send = |local: &std::path::Path, path: &str| {
        h.instance
            .send_file(SendFile::new(local, path), Timeout::NoWait)
            .err()
    };

    assert_eq!(send(dir.as_path(), "x"), Some(ActionError::NotAFile));
    assert_eq!(send(dir.join("missing.bin").as_path(), "x"), Some(ActionError::NotAFile));
    assert_eq!(send(std::path::Path::new(""), "x"), Some(ActionError::InvalidLocalPath));
    std::fs::write(dir.join("a.txt"), b"a").unwrap();
    assert_eq!(send(dir.join("a.txt").as_path(), ""), Some(ActionError::InvalidCloudPath));
    assert_eq!(h.instance.pending_transactions(), 0);

    let h = start(config());
    let result = h
        .instance
        .send_file(SendFile::new(dir.join("a.txt"), "x"), Timeout::NoWait);
    assert_eq!(result.err(), Some(ActionError::FileSystemNotSupported));
}

// ── Binary data points ───────────────────────────────────────

#[test]
fn binary_datapoints_overwrite_the_stream_resource() {
    let h = start(full_config());
    let point = BinaryDataPoint::new("camera/frame", BinarySource::Data(vec![1u8, 2, 3]));
    assert_eq!(point.cloud_path(), "DataPoint/camera/frame.bin");
    h.instance
        .send_binary_datapoint(point, Timeout::Bounded(WAIT))
        .unwrap();
    assert_eq!(h.cloud.stored("DataPoint/camera/frame.bin").unwrap(), [1u8, 2, 3]);

    let local = scratch_dir("binary-dp").join("frame.raw");
    std::fs::write(&local, [9u8, 9]).unwrap();
    let mut point = BinaryDataPoint::new("camera/frame", BinarySource::File(local));
    point.response_required = true;
    let reply = h
        .instance
        .send_binary_datapoint(point, Timeout::Bounded(WAIT))
        .unwrap();
    assert_eq!(reply.response, [9u8, 9]);
    assert_eq!(h.cloud.stored("DataPoint/camera/frame.bin").unwrap(), [9u8, 9]);
    assert!(h.cloud.archived("DataPoint/camera/frame.bin").is_empty());

    let bad_id = BinaryDataPoint::new("no spaces", BinarySource::Data(vec![1]));
    assert_eq!(
        h.instance.send_binary_datapoint(bad_id, Timeout::NoWait).err(),
        Some(ActionError::InvalidStreamId)
    );
    let empty = BinaryDataPoint::new("camera/frame", BinarySource::Data(Vec::new()));
    assert_eq!(
        h.instance.send_binary_datapoint(empty, Timeout::NoWait).err(),
        Some(ActionError::InvalidData)
    );
}

// ── Collections ──────────────────────────────────────────────

fn temperatures() -> DataPointCollection {
    let mut c = DataPointCollection::new();
    c.add_stream_extra("temp", "float ts_epoch_ms", Some("C"), None)
        .unwrap();
    for (ms, v) in [(1_000, 21.5), (2_000, 22.0)] {
        c.add(
            "temp",
            DataPoint::new(Value::Float(v)).at(Timestamp::EpochMs(ms)),
        )
        .unwrap();
    }
    c
}

#[test]
fn collection_upload_with_reply_clears_the_samples() {
    let h = start(config());
    let mut c = temperatures();
    let reply = h
        .instance
        .send_datapoints(Transport::Tcp, &mut c, true, Timeout::Bounded(WAIT))
        .unwrap();

    let echoed: serde_json::Value = serde_json::from_slice(&reply.response).unwrap();
    assert_eq!(echoed[0]["id"], "temp");
    assert_eq!(echoed[0]["units"], "C");
    assert_eq!(echoed[0]["points"].as_array().map(Vec::len), Some(2));
    assert_eq!(c.point_count(), 0);
    assert_eq!(c.streams().len(), 1);
}

#[test]
fn collection_upload_without_reply() {
    let h = start(config());
    let mut c = temperatures();
    let reply = h
        .instance
        .send_datapoints(Transport::Tcp, &mut c, false, Timeout::Bounded(WAIT))
        .unwrap();
    assert!(reply.response.is_empty());
    assert_eq!(c.point_count(), 0);

    let uploaded = h
        .cloud
        .actions()
        .into_iter()
        .find_map(|a| match a {
            Action::DataPoints(u) => Some(u),
            _ => None,
        })
        .unwrap();
    assert!(!uploaded.response_required);
    assert_eq!(uploaded.streams[0].points.len(), 2);

    assert_eq!(
        h.instance
            .send_datapoints(Transport::Tcp, &mut c, false, Timeout::NoWait)
            .err(),
        Some(ActionError::EmptyCollection)
    );
}

#[test]
fn failed_collection_upload_keeps_the_samples() {
    let h = start(config());
    h.cloud.release_held(CompletionStatus::Error(3));
    let mut c = temperatures();
    let result = h
        .instance
        .send_datapoints(Transport::Tcp, &mut c, true, Timeout::Bounded(WAIT));
    assert_eq!(result.err(), Some(ActionError::Failed(CompletionStatus::Error(3))));
    assert_eq!(c.point_count(), 2);

    let mut disabled = config();
    disabled.services.data = None;
    let h = start(disabled);
    assert_eq!(
        h.instance
            .send_datapoints(Transport::Tcp, &mut c, true, Timeout::NoWait)
            .err(),
        Some(ActionError::ServiceDisabled)
    );
}
