//! Administrative query operations over the ingest socket.

use super::common::{wait_for, TestProxy};
use tau_metric_proxy::{MetricKind, ProxyQuery};

#[test]
fn list_all_on_an_empty_proxy_is_empty() {
    let proxy = TestProxy::start();
    let mut query = ProxyQuery::connect(&proxy.socket).unwrap();
    assert!(query.list_all().unwrap().is_empty());
    // The connection stays usable for a follow-up query.
    assert!(query.get_all().unwrap().is_empty());
}

#[test]
fn queries_reflect_registered_metrics() {
    let proxy = TestProxy::start();

    let client = proxy.client("", "");
    client.counter("requests_total", "Total requests").add(8.0);
    client.gauge("temp", "Temperature").set(10.0);
    client.shutdown();

    wait_for("metrics ingested", || {
        proxy
            .state
            .main
            .get("requests_total")
            .is_some_and(|m| m.cell().value.scalar() == 8.0)
    });

    let mut query = ProxyQuery::connect(&proxy.socket).unwrap();

    let mut listed = query.list_all().unwrap();
    listed.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].name, "requests_total");
    assert_eq!(listed[0].kind, MetricKind::Counter);
    assert_eq!(listed[1].name, "temp");
    assert_eq!(listed[1].kind, MetricKind::Gauge);

    let values = query.get_all().unwrap();
    assert_eq!(values.len(), 2);
    let requests = values.iter().find(|e| e.name == "requests_total").unwrap();
    assert_eq!(requests.value, 8.0);

    let one = query.get_one("requests_total").unwrap().unwrap();
    assert_eq!(one.value, 8.0);
    assert!(query.get_one("missing").unwrap().is_none());
}
