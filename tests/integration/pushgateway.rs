//! End-to-end ingest behavior through the real socket.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use super::common::{wait_for, TestProxy};
use tau_metric_proxy::wire::{Message, MetricDescriptor, MetricEvent, MetricKind};

fn raw_desc(name: &str, kind: MetricKind) -> Message {
    Message::Desc(MetricDescriptor {
        name: name.to_string(),
        doc: format!("{name} docs"),
        kind,
    })
}

fn raw_val(name: &str, value: f64) -> Message {
    Message::Val(MetricEvent {
        name: name.to_string(),
        value,
        update_ts: 0.0,
    })
}

#[test]
fn counter_deltas_accumulate_across_flushes() {
    let proxy = TestProxy::start();
    let client = proxy.client("J1", "./app");
    assert!(client.is_connected());

    let requests = client.counter("requests_total", "Total requests served");
    requests.add(5.0);
    wait_for("first delta flushed", || {
        proxy
            .state
            .main
            .get("requests_total")
            .is_some_and(|m| m.cell().value.scalar() >= 5.0)
    });

    requests.add(3.0);
    client.shutdown();

    wait_for("second delta flushed", || {
        proxy
            .state
            .main
            .get("requests_total")
            .is_some_and(|m| m.cell().value.scalar() == 8.0)
    });
    assert!(proxy.metrics_text().contains("requests_total 8\n"));
}

#[test]
fn gauge_observations_fold_into_min_max_avg() {
    let proxy = TestProxy::start();

    let mut conn = UnixStream::connect(&proxy.socket).unwrap();
    raw_desc("temp", MetricKind::Gauge).write_to(&mut conn).unwrap();
    for v in [10.0, 20.0, 30.0] {
        raw_val("temp", v).write_to(&mut conn).unwrap();
    }
    conn.flush().unwrap();

    wait_for("gauge folded", || {
        proxy
            .state
            .main
            .get("temp")
            .is_some_and(|m| m.cell().value.scalar() == 21.25)
    });
    assert!(proxy.metrics_text().contains("temp 21.25\n"));
}

#[test]
fn second_desc_with_other_kind_closes_the_connection() {
    let proxy = TestProxy::start();

    let mut conn = UnixStream::connect(&proxy.socket).unwrap();
    raw_desc("x", MetricKind::Counter).write_to(&mut conn).unwrap();
    raw_desc("x", MetricKind::Gauge).write_to(&mut conn).unwrap();
    conn.flush().unwrap();

    // The server hangs up on us.
    let mut buf = [0_u8; 1];
    assert_eq!(conn.read(&mut buf).unwrap_or(0), 0);

    // The metric keeps its original kind and the server keeps serving.
    assert_eq!(
        proxy.state.main.get("x").unwrap().kind(),
        MetricKind::Counter
    );
    let mut conn = UnixStream::connect(&proxy.socket).unwrap();
    raw_desc("x", MetricKind::Counter).write_to(&mut conn).unwrap();
    raw_val("x", 1.0).write_to(&mut conn).unwrap();
    conn.flush().unwrap();
    wait_for("survivor connection ingests", || {
        proxy
            .state
            .main
            .get("x")
            .is_some_and(|m| m.cell().value.scalar() == 1.0)
    });
}

#[test]
fn value_for_unregistered_metric_closes_the_connection() {
    let proxy = TestProxy::start();

    let mut conn = UnixStream::connect(&proxy.socket).unwrap();
    raw_val("never_registered", 1.0).write_to(&mut conn).unwrap();
    conn.flush().unwrap();

    let mut buf = [0_u8; 1];
    assert_eq!(conn.read(&mut buf).unwrap_or(0), 0);
    assert!(proxy.state.main.get("never_registered").is_none());
}
